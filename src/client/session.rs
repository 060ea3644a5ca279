use futures_util::future;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::blob;
use crate::error::{ChatError, ChatResult};
use crate::id::{MessageId, RoomId, UserId};
use crate::identity::Identity;
use crate::messages::{Attachment, Cursor, Message, MessageDraft, ReplyPreview};
use crate::presence::{PresenceEvent, TypingUser};
use crate::rooms::Room;

use super::event::ClientEvent;
use super::hub::Hub;
use super::registry::SessionId;
use super::subscription::{Hold, Subscription};

/// A text message as a client submits it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Outgoing {
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default)]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: Room,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MyRooms {
    pub owned: Vec<RoomSummary>,
    pub participating: Vec<RoomSummary>,
}

/// What one connected client can do. Failures come back typed; turning
/// them into something a person reads is the caller's job.
#[derive(Clone)]
pub struct ClientSession {
    hub: Hub,
    identity: Identity,
    id: SessionId,
}

impl ClientSession {
    pub(crate) fn new(hub: Hub, identity: Identity) -> Self {
        Self { hub, identity, id: SessionId::new() }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn me(&self) -> &UserId {
        &self.identity.id
    }

    fn authorize(&self, room: &Room) -> ChatResult<()> {
        if !room.is_temporary && self.identity.is_guest {
            return Err(ChatError::PermissionDenied(
                "guests can only join temporary rooms".into(),
            ));
        }
        Ok(())
    }

    /// Looks the room up and checks this identity may use it.
    pub async fn room(&self, room_id: RoomId) -> ChatResult<Room> {
        let room = self.hub.rooms.require_room(room_id).await?;
        self.authorize(&room)?;
        Ok(room)
    }

    pub async fn create_room(&self, name: &str, is_temporary: bool) -> ChatResult<Room> {
        if self.identity.is_guest && !is_temporary {
            return Err(ChatError::PermissionDenied(
                "guests can only create temporary rooms".into(),
            ));
        }
        self.hub.lifecycle.create_room(name, self.me(), is_temporary).await
    }

    pub async fn delete_room(&self, room_id: RoomId) -> ChatResult<()> {
        self.hub.lifecycle.delete_room(room_id, self.me()).await
    }

    pub async fn my_rooms(&self) -> ChatResult<MyRooms> {
        let owned = self.hub.rooms.permanent_rooms_of(self.me()).await?;
        let participating = self.hub.rooms.participating_rooms(self.me()).await?;
        Ok(MyRooms {
            owned: self.summarize(owned).await?,
            participating: self.summarize(participating).await?,
        })
    }

    async fn summarize(&self, rooms: Vec<Room>) -> ChatResult<Vec<RoomSummary>> {
        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let last_message = self.hub.log.last(room.id).await?;
            summaries.push(RoomSummary { room, last_message });
        }
        Ok(summaries)
    }

    pub async fn subscribe(&self, room_id: RoomId) -> ChatResult<Subscription> {
        self.resume(room_id, Cursor::START).await
    }

    /// Joins the room and streams everything after `cursor`, then live.
    /// Presence is never replayed: the stream opens with the current
    /// active set and typing state instead.
    pub async fn resume(&self, room_id: RoomId, cursor: Cursor) -> ChatResult<Subscription> {
        self.room(room_id).await?;

        let (lease, cancel) = self.hub.sessions.attach(self.id, room_id, self.me());
        let hold = Hold::new(self.hub.lifecycle.clone(), self.hub.sessions.clone(), lease);
        // From here on every early return drops `hold`, which leaves again.
        self.hub.lifecycle.join(room_id, self.me()).await?;
        let log_events = self.hub.log.stream_since(room_id, cursor).await?;
        let rx = self.hub.presence.subscribe(room_id);

        let current = [
            PresenceEvent::ActiveUsers { users: self.hub.presence.active_users(room_id) },
            PresenceEvent::Typing { users: self.hub.presence.typing_users(room_id, self.me()) },
        ];
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        let me = self.me().clone();
        let presence = stream::iter(current)
            .chain(live)
            .map(move |event| ClientEvent::Presence(hide_self(event, &me)));

        let events = stream::select(log_events.map(ClientEvent::from), presence)
            .take_until(cancel.cancelled_owned())
            .scan(false, |deleted, event| {
                let next = (!*deleted).then(|| {
                    *deleted = matches!(event, ClientEvent::RoomDeleted { .. });
                    event
                });
                future::ready(next)
            })
            .boxed();

        debug!(room_id = %room_id, user_id = %self.me(), session = %self.id, after_seq = cursor.seq, "subscribed");
        Ok(Subscription::new(room_id, cursor, events, hold))
    }

    pub async fn history(&self, room_id: RoomId, cursor: Cursor) -> ChatResult<Vec<Message>> {
        self.room(room_id).await?;
        self.hub.log.history(room_id, cursor).await
    }

    async fn reply_preview(&self, room_id: RoomId, reply_to: Option<MessageId>) -> ChatResult<Option<ReplyPreview>> {
        match reply_to {
            Some(id) => Ok(Some(ReplyPreview::from(&self.hub.log.get(room_id, id).await?))),
            None => Ok(None),
        }
    }

    async fn post(&self, room_id: RoomId, mut draft: MessageDraft, reply_to: Option<MessageId>) -> ChatResult<Message> {
        if let Some(preview) = self.reply_preview(room_id, reply_to).await? {
            draft = draft.replying_to(preview);
        }
        let message = self.hub.log.append(room_id, draft).await?;
        self.hub.presence.stop_typing(room_id, self.me());
        Ok(message)
    }

    pub async fn send(&self, room_id: RoomId, outgoing: Outgoing) -> ChatResult<Message> {
        self.room(room_id).await?;
        let mut draft = MessageDraft::text(self.me().clone(), &self.identity.display_name, outgoing.content);
        if outgoing.destructive {
            draft = draft.destructive();
        }
        if let Some(token) = outgoing.client_token {
            draft = draft.with_token(token);
        }
        self.post(room_id, draft, outgoing.reply_to).await
    }

    /// Stores the bytes with the blob provider and posts an image or file
    /// message pointing at them. Oversize payloads never reach the provider.
    pub async fn upload(
        &self,
        room_id: RoomId,
        file_name: &str,
        bytes: Vec<u8>,
        reply_to: Option<MessageId>,
        destructive: bool,
    ) -> ChatResult<Message> {
        blob::check_size(bytes.len())?;
        if file_name.trim().is_empty() {
            return Err(ChatError::InvalidMessage("file name is required".into()));
        }
        self.room(room_id).await?;
        // Resolve the reply target first so a dangling reference stores nothing.
        let preview = self.reply_preview(room_id, reply_to).await?;

        let file_size = bytes.len() as u64;
        let object = blob::object_name(self.hub.clock.now_millis(), file_name);
        let url = self.hub.blobs.put(&object, bytes).await?;

        let attachment = Attachment { file_name: file_name.to_owned(), file_size };
        let mut draft = MessageDraft::attachment(self.me().clone(), &self.identity.display_name, url, attachment);
        if destructive {
            draft = draft.destructive();
        }
        if let Some(preview) = preview {
            draft = draft.replying_to(preview);
        }
        self.post(room_id, draft, None).await
    }

    pub async fn mark_read(&self, room_id: RoomId, ids: &[MessageId]) -> ChatResult<Vec<MessageId>> {
        self.room(room_id).await?;
        self.hub.log.mark_read(room_id, ids, self.me()).await
    }

    /// Typing is only meaningful while subscribed.
    pub fn start_typing(&self, room_id: RoomId) -> ChatResult<()> {
        if !self.hub.rooms.active_users(room_id).contains(self.me()) {
            return Err(ChatError::NotFound(format!("not subscribed to room {room_id}")));
        }
        self.hub.presence.start_typing(room_id, self.me(), &self.identity.display_name);
        Ok(())
    }

    pub fn stop_typing(&self, room_id: RoomId) {
        self.hub.presence.stop_typing(room_id, self.me());
    }

    pub fn typing_users(&self, room_id: RoomId) -> Vec<TypingUser> {
        self.hub.presence.typing_users(room_id, self.me())
    }

    pub fn heartbeat(&self) {
        self.hub.sessions.touch(self.id);
    }
}

fn hide_self(event: PresenceEvent, me: &UserId) -> PresenceEvent {
    match event {
        PresenceEvent::Typing { mut users } => {
            users.retain(|u| u.user_id != *me);
            PresenceEvent::Typing { users }
        }
        other => other,
    }
}
