//! Per-room publication point.
//!
//! Appends reserve a sequence number up front, write to storage without any
//! lock held, and then report back. The feed releases messages to
//! subscribers strictly in sequence order, so a slow write holds back later
//! ones instead of letting them overtake it. A failed write leaves a hole
//! that is skipped.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::clock::Millis;
use crate::error::{ChatError, ChatResult};
use crate::id::RoomId;

use super::model::{LogEvent, Message};

pub(crate) struct Feed {
    room_id: RoomId,
    tx: broadcast::Sender<LogEvent>,
    state: Mutex<Sequencer>,
}

struct Sequencer {
    next_seq: u64,
    last_timestamp: Millis,
    next_publish: u64,
    pending: BTreeMap<u64, Option<Message>>,
    closed: bool,
}

/// Order key and server time handed to one append.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reservation {
    pub seq: u64,
    pub timestamp: Millis,
}

impl Feed {
    /// `last_seq`/`last_timestamp` are what storage already holds.
    pub fn new(room_id: RoomId, last_seq: u64, last_timestamp: Millis, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            room_id,
            tx,
            state: Mutex::new(Sequencer {
                next_seq: last_seq + 1,
                last_timestamp,
                next_publish: last_seq + 1,
                pending: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    /// Timestamps never go backwards within a room, even if the wall clock does.
    pub fn reserve(&self, now: Millis) -> ChatResult<Reservation> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChatError::NotFound(format!("room {}", self.room_id)));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.last_timestamp = state.last_timestamp.max(now);
        Ok(Reservation { seq, timestamp: state.last_timestamp })
    }

    /// Report the outcome of a reserved append. `None` marks a hole.
    pub fn complete(&self, seq: u64, outcome: Option<Message>) {
        let mut state = self.state.lock();
        if seq < state.next_publish {
            return;
        }
        state.pending.insert(seq, outcome);
        loop {
            let next = state.next_publish;
            let Some(slot) = state.pending.remove(&next) else {
                break;
            };
            state.next_publish += 1;
            if let Some(message) = slot {
                let _ = self.tx.send(LogEvent::Appended { message });
            }
        }
    }

    /// Subscribe and learn the first sequence number that will arrive live.
    /// Everything below it is already in storage (or was a hole).
    pub fn watch(&self) -> ChatResult<(broadcast::Receiver<LogEvent>, u64)> {
        let state = self.state.lock();
        if state.closed {
            return Err(ChatError::NotFound(format!("room {}", self.room_id)));
        }
        Ok((self.tx.subscribe(), state.next_publish))
    }

    /// Out-of-band events (retractions, receipts). Ordered with respect to
    /// appends already released.
    pub fn publish(&self, event: LogEvent) {
        let state = self.state.lock();
        if !state.closed {
            let _ = self.tx.send(event);
        }
    }

    /// Final event for this room; later reservations fail with `NotFound`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.pending.clear();
        let _ = self.tx.send(LogEvent::RoomDeleted { room_id: self.room_id });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Fills the hole for a reservation whose write never reported back, e.g.
/// because the writing task panicked.
pub(crate) struct SlotGuard<'a> {
    feed: &'a Feed,
    seq: u64,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    pub fn new(feed: &'a Feed, seq: u64) -> Self {
        Self { feed, seq, armed: true }
    }

    pub fn complete(mut self, outcome: Option<Message>) {
        self.armed = false;
        self.feed.complete(self.seq, outcome);
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.feed.complete(self.seq, None);
        }
    }
}
