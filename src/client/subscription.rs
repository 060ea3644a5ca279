use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{BoxStream, Stream, StreamExt};
use tracing::warn;

use crate::error::ChatResult;
use crate::id::RoomId;
use crate::messages::Cursor;
use crate::rooms::Lifecycle;

use super::event::ClientEvent;
use super::registry::{LeaseId, SessionRegistry};

/// A user's hold on room membership. Released exactly once: explicitly, or
/// on drop through a spawned `leave`.
pub(crate) struct Hold {
    lifecycle: Lifecycle,
    registry: SessionRegistry,
    lease: LeaseId,
    released: bool,
}

impl Hold {
    pub(crate) fn new(lifecycle: Lifecycle, registry: SessionRegistry, lease: LeaseId) -> Self {
        Self { lifecycle, registry, lease, released: false }
    }

    pub(crate) async fn release(mut self) -> ChatResult<()> {
        self.released = true;
        match self.registry.detach(self.lease) {
            Some((room_id, user_id)) => self.lifecycle.leave(room_id, &user_id).await,
            None => Ok(()),
        }
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Outside a runtime the lease stays registered and the heartbeat
        // reaper lets the user go.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some((room_id, user_id)) = self.registry.detach(self.lease) {
            let lifecycle = self.lifecycle.clone();
            runtime.spawn(async move {
                if let Err(e) = lifecycle.leave(room_id, &user_id).await {
                    warn!(room_id = %room_id, user_id = %user_id, error = %e, "leave after disconnect failed");
                }
            });
        }
    }
}

/// Live view of one room for one client. Ends after `RoomDeleted`, when the
/// session is reaped, or never; dropping it leaves the room.
pub struct Subscription {
    room_id: RoomId,
    cursor: Cursor,
    events: BoxStream<'static, ClientEvent>,
    hold: Option<Hold>,
}

impl Subscription {
    pub(crate) fn new(room_id: RoomId, cursor: Cursor, events: BoxStream<'static, ClientEvent>, hold: Hold) -> Self {
        Self { room_id, cursor, events, hold: Some(hold) }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Last message delivered; hand it to `resume` after a reconnect.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Unsubscribes and waits for the leave (and any cascade it triggers).
    pub async fn close(mut self) -> ChatResult<()> {
        match self.hold.take() {
            Some(hold) => hold.release().await,
            None => Ok(()),
        }
    }
}

impl Stream for Subscription {
    type Item = ClientEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ClientEvent>> {
        let this = self.get_mut();
        match this.events.poll_next_unpin(cx) {
            Poll::Ready(Some(event)) => {
                if let ClientEvent::Message { message } = &event {
                    this.cursor = message.cursor();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.hold.take();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
