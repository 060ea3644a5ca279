//! Soft presence state: who is typing, who is connected.
//!
//! Nothing here needs an explicit retraction to stay correct. Typing signals
//! carry their renewal time and are dropped after the TTL by the sweeper;
//! readers additionally ignore anything older than the staleness window, so
//! a crashed client can never leave a permanent "is typing".

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::{Millis, SharedClock, millis};
use crate::config::CoreConfig;
use crate::id::{RoomId, UserId};
use crate::rooms::RoomStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUser {
    pub user_id: UserId,
    pub display_name: String,
}

/// Current-state snapshots. Never replayed; a late subscriber asks the
/// tracker for the present instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    Typing { users: Vec<TypingUser> },
    ActiveUsers { users: BTreeSet<UserId> },
}

#[derive(Debug)]
struct TypingSignal {
    display_name: String,
    last_renewed_at: Millis,
}

struct RoomPresence {
    typing: HashMap<UserId, TypingSignal>,
    tx: broadcast::Sender<PresenceEvent>,
}

impl RoomPresence {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { typing: HashMap::new(), tx }
    }

    fn snapshot(&self, now: Millis, staleness: Millis, exclude: Option<&UserId>) -> Vec<TypingUser> {
        let mut users: Vec<TypingUser> = self
            .typing
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .filter(|(_, signal)| now - signal.last_renewed_at < staleness)
            .map(|(id, signal)| TypingUser {
                user_id: id.clone(),
                display_name: signal.display_name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    fn announce(&self, now: Millis, staleness: Millis) {
        let users = self.snapshot(now, staleness, None);
        let _ = self.tx.send(PresenceEvent::Typing { users });
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    rooms: RoomStore,
    clock: SharedClock,
    config: Arc<CoreConfig>,
    state: Arc<Mutex<HashMap<RoomId, RoomPresence>>>,
}

impl PresenceTracker {
    pub fn new(rooms: RoomStore, clock: SharedClock, config: Arc<CoreConfig>) -> Self {
        Self {
            rooms,
            clock,
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn staleness(&self) -> Millis {
        millis(self.config.typing_staleness)
    }

    /// Upserts the user's typing signal. Renewals are silent; only a user
    /// who starts typing is announced.
    pub fn start_typing(&self, room_id: RoomId, user_id: &UserId, display_name: &str) {
        let now = self.clock.now_millis();
        let staleness = self.staleness();
        let capacity = self.config.feed_capacity;
        let mut state = self.state.lock();
        let room = state.entry(room_id).or_insert_with(|| RoomPresence::new(capacity));

        let was_visible = room
            .typing
            .get(user_id)
            .is_some_and(|s| now - s.last_renewed_at < millis(self.config.typing_ttl));
        room.typing.insert(
            user_id.clone(),
            TypingSignal {
                display_name: display_name.to_owned(),
                last_renewed_at: now,
            },
        );
        if !was_visible {
            debug!(room_id = %room_id, user_id = %user_id, "typing");
            room.announce(now, staleness);
        }
    }

    pub fn stop_typing(&self, room_id: RoomId, user_id: &UserId) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if let Some(room) = state.get_mut(&room_id) {
            if room.typing.remove(user_id).is_some() {
                room.announce(now, self.staleness());
            }
        }
    }

    /// Who is typing, as seen by `requester` (never included).
    pub fn typing_users(&self, room_id: RoomId, requester: &UserId) -> Vec<TypingUser> {
        let now = self.clock.now_millis();
        self.state
            .lock()
            .get(&room_id)
            .map(|room| room.snapshot(now, self.staleness(), Some(requester)))
            .unwrap_or_default()
    }

    /// Mirror of the room store's active set.
    pub fn active_users(&self, room_id: RoomId) -> BTreeSet<UserId> {
        self.rooms.active_users(room_id)
    }

    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<PresenceEvent> {
        let capacity = self.config.feed_capacity;
        self.state
            .lock()
            .entry(room_id)
            .or_insert_with(|| RoomPresence::new(capacity))
            .tx
            .subscribe()
    }

    /// Broadcasts the current active set after a join or leave.
    pub fn membership_changed(&self, room_id: RoomId) {
        let users = self.rooms.active_users(room_id);
        if let Some(room) = self.state.lock().get(&room_id) {
            let _ = room.tx.send(PresenceEvent::ActiveUsers { users });
        }
    }

    /// Drops signals that were not renewed within the TTL and announces the
    /// rooms that changed. Rooms with no signals and no listeners are
    /// forgotten. Returns how many signals expired.
    pub fn expire_stale(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl = millis(self.config.typing_ttl);
        let staleness = self.staleness();
        let mut expired = 0;

        let mut state = self.state.lock();
        state.retain(|room_id, room| {
            let before = room.typing.len();
            room.typing.retain(|_, signal| now - signal.last_renewed_at < ttl);
            let dropped = before - room.typing.len();
            if dropped > 0 {
                debug!(room_id = %room_id, dropped, "typing signals expired");
                expired += dropped;
                room.announce(now, staleness);
            }
            !room.typing.is_empty() || room.tx.receiver_count() > 0
        });
        expired
    }

    /// Room deleted: listeners see their presence channel close.
    pub fn forget_room(&self, room_id: RoomId) {
        self.state.lock().remove(&room_id);
    }
}
