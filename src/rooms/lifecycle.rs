use std::time::Duration;

use tracing::{info, warn};

use crate::clock::{SharedClock, millis};
use crate::db;
use crate::error::{ChatError, ChatResult};
use crate::id::{RoomId, UserId};
use crate::messages::MessageLog;
use crate::presence::PresenceTracker;

use super::store::{LeaveOutcome, Room, RoomStore};

/// Owns room creation and teardown. Deleting a room removes its record,
/// every message and receipt in it, and ends all live subscriptions, and
/// that cascade runs at most once per room however many callers race.
#[derive(Clone)]
pub struct Lifecycle {
    rooms: RoomStore,
    log: MessageLog,
    presence: PresenceTracker,
    clock: SharedClock,
}

impl Lifecycle {
    pub fn new(rooms: RoomStore, log: MessageLog, presence: PresenceTracker, clock: SharedClock) -> Self {
        Self { rooms, log, presence, clock }
    }

    pub async fn create_room(&self, name: &str, owner_id: &UserId, is_temporary: bool) -> ChatResult<Room> {
        self.rooms.create_room(name, owner_id, is_temporary).await
    }

    pub async fn join(&self, room_id: RoomId, user_id: &UserId) -> ChatResult<()> {
        self.rooms.join(room_id, user_id).await?;
        self.presence.membership_changed(room_id);
        Ok(())
    }

    /// Removes the user from the active set. When that empties a temporary
    /// room, the caller that emptied it runs the cascade.
    pub async fn leave(&self, room_id: RoomId, user_id: &UserId) -> ChatResult<()> {
        self.presence.stop_typing(room_id, user_id);
        match self.rooms.leave(room_id, user_id) {
            LeaveOutcome::CascadeClaimed => self.cascade(room_id).await,
            LeaveOutcome::Left => {
                self.presence.membership_changed(room_id);
                Ok(())
            }
            LeaveOutcome::Gone => Ok(()),
        }
    }

    /// Owner-initiated deletion.
    pub async fn delete_room(&self, room_id: RoomId, requester: &UserId) -> ChatResult<()> {
        let room = self.rooms.require_room(room_id).await?;
        if room.owner_id != *requester {
            return Err(ChatError::PermissionDenied("only the owner can delete a room".into()));
        }
        if !self.rooms.claim_deletion(room_id, room.is_temporary) {
            return Err(ChatError::NotFound(format!("room {room_id}")));
        }
        self.cascade(room_id).await
    }

    /// Deletes temporary rooms that have been empty for longer than `grace`:
    /// rooms nobody ever joined, and rooms whose cascade failed earlier.
    pub async fn collect_abandoned(&self, grace: Duration) -> ChatResult<usize> {
        let mut collected = 0;
        for (room_id, created_at, cutoff) in self.rooms.stale_temporary_rooms(grace).await? {
            if !self.rooms.claim_if_abandoned(room_id, created_at, cutoff) {
                continue;
            }
            if self.cascade(room_id).await.is_ok() {
                collected += 1;
            }
        }
        Ok(collected)
    }

    /// Drops the in-memory record of rooms deleted more than `retention`
    /// ago. Storage is authoritative for them from then on.
    pub fn prune_tombstones(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now_millis() - millis(retention);
        let pruned = self.rooms.prune_tombstones(cutoff);
        self.log.prune_closed(cutoff);
        pruned
    }

    /// Runs with the room's deletion claim held; no lock is held across I/O.
    async fn cascade(&self, room_id: RoomId) -> ChatResult<()> {
        match db::delete_room_cascade(self.rooms.pool(), room_id).await {
            Ok(existed) => {
                let evicted = self.rooms.forget(room_id);
                self.log.close_room(room_id);
                self.presence.forget_room(room_id);
                info!(room_id = %room_id, existed, evicted = evicted.len(), "room deleted");
                Ok(())
            }
            Err(e) => {
                self.rooms.release_claim(room_id);
                warn!(room_id = %room_id, error = %e, "room deletion failed, will retry");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CoreConfig;
    use crate::messages::{Cursor, LogEvent, MessageDraft};

    struct Fixture {
        lifecycle: Lifecycle,
        rooms: RoomStore,
        log: MessageLog,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let pool = db::connect_in_memory().await.unwrap();
        let clock = ManualClock::new(10_000);
        let config = Arc::new(CoreConfig::default());
        let rooms = RoomStore::new(pool.clone(), clock.clone(), config.clone());
        let log = MessageLog::new(pool, clock.clone(), config.clone());
        let presence = PresenceTracker::new(rooms.clone(), clock.clone(), config);
        Fixture {
            lifecycle: Lifecycle::new(rooms.clone(), log.clone(), presence, clock.clone()),
            rooms,
            log,
            clock,
        }
    }

    #[tokio::test]
    async fn last_leave_deletes_temporary_room_and_its_messages() {
        let f = fixture().await;
        let room = f.lifecycle.create_room("t", &"o".into(), true).await.unwrap();
        f.lifecycle.join(room.id, &"a".into()).await.unwrap();
        f.log.append(room.id, MessageDraft::text("a".into(), "A", "hi")).await.unwrap();

        let mut stream = f.log.stream_since(room.id, Cursor::START).await.unwrap();
        assert!(matches!(stream.next().await, Some(LogEvent::Appended { .. })));

        f.lifecycle.leave(room.id, &"a".into()).await.unwrap();
        assert!(f.rooms.get_room(room.id).await.unwrap().is_none());
        assert!(matches!(stream.next().await, Some(LogEvent::RoomDeleted { .. })));
        assert!(stream.next().await.is_none());

        assert!(f.log.history(room.id, Cursor::START).await.unwrap().is_empty());
        let err = f.log.append(room.id, MessageDraft::text("a".into(), "A", "late")).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn permanent_room_survives_being_emptied() {
        let f = fixture().await;
        let room = f.lifecycle.create_room("p", &"o".into(), false).await.unwrap();
        f.lifecycle.join(room.id, &"a".into()).await.unwrap();
        f.lifecycle.leave(room.id, &"a".into()).await.unwrap();
        assert!(f.rooms.get_room(room.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_last_leaves_delete_exactly_once() {
        let f = fixture().await;
        let room = f.lifecycle.create_room("t", &"o".into(), true).await.unwrap();
        f.lifecycle.join(room.id, &"a".into()).await.unwrap();
        f.lifecycle.join(room.id, &"b".into()).await.unwrap();

        let (ann, ben) = (UserId::from("a"), UserId::from("b"));
        let (a, b) = tokio::join!(f.lifecycle.leave(room.id, &ann), f.lifecycle.leave(room.id, &ben));
        a.unwrap();
        b.unwrap();
        assert!(f.rooms.get_room(room.id).await.unwrap().is_none());

        // A straggler leaving again is a no-op.
        f.lifecycle.leave(room.id, &ann).await.unwrap();
    }

    #[tokio::test]
    async fn only_owner_may_delete() {
        let f = fixture().await;
        let room = f.lifecycle.create_room("p", &"o".into(), false).await.unwrap();

        let err = f.lifecycle.delete_room(room.id, &"mallory".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        f.lifecycle.delete_room(room.id, &"o".into()).await.unwrap();
        let err = f.lifecycle.delete_room(room.id, &"o".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(f.rooms.count_permanent_rooms(&"o".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn never_joined_temporary_room_is_collected_after_grace() {
        let f = fixture().await;
        let room = f.lifecycle.create_room("t", &"o".into(), true).await.unwrap();
        let grace = Duration::from_secs(60);

        assert_eq!(f.lifecycle.collect_abandoned(grace).await.unwrap(), 0);
        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.lifecycle.collect_abandoned(grace).await.unwrap(), 1);
        assert!(f.rooms.get_room(room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleted_rooms_are_not_remembered_forever() {
        let f = fixture().await;
        let guest = UserId::from("guest_1");
        let mut ids = Vec::new();
        for i in 0..50 {
            let room = f.lifecycle.create_room(&format!("t{i}"), &"o".into(), true).await.unwrap();
            f.lifecycle.join(room.id, &guest).await.unwrap();
            f.log.append(room.id, MessageDraft::text(guest.clone(), "G", "hi")).await.unwrap();
            f.lifecycle.leave(room.id, &guest).await.unwrap();
            ids.push(room.id);
        }
        assert_eq!(f.rooms.tracked(), (0, 50));
        assert_eq!(f.log.tracked(), (0, 50));

        let retention = Duration::from_secs(60);
        assert_eq!(f.lifecycle.prune_tombstones(retention), 0);
        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.lifecycle.prune_tombstones(retention), 50);
        assert_eq!(f.rooms.tracked(), (0, 0));
        assert_eq!(f.log.tracked(), (0, 0));

        // Without the tombstone, storage still answers for the room.
        let gone = ids[0];
        assert!(f.rooms.get_room(gone).await.unwrap().is_none());
        assert!(matches!(f.lifecycle.join(gone, &guest).await, Err(ChatError::NotFound(_))));
        let err = f.log.append(gone, MessageDraft::text(guest.clone(), "G", "late")).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(f.log.tracked(), (0, 0));
    }

    #[tokio::test]
    async fn occupied_room_is_not_collected() {
        let f = fixture().await;
        let room = f.lifecycle.create_room("t", &"o".into(), true).await.unwrap();
        f.lifecycle.join(room.id, &"a".into()).await.unwrap();

        f.clock.advance(Duration::from_secs(600));
        assert_eq!(f.lifecycle.collect_abandoned(Duration::from_secs(60)).await.unwrap(), 0);
        assert!(f.rooms.get_room(room.id).await.unwrap().is_some());
    }
}
