use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::clock::{Millis, SharedClock, millis};
use crate::config::CoreConfig;
use crate::db::RoomRow;
use crate::error::{ChatError, ChatResult};
use crate::id::{RoomId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub owner_id: UserId,
    pub created_at: Millis,
    pub is_temporary: bool,
    /// Currently connected identities. Never persisted.
    pub active_users: BTreeSet<UserId>,
    /// Everyone who ever joined a permanent room. Empty for temporary rooms.
    pub participants: BTreeSet<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The user left (or was not there); the room lives on.
    Left,
    /// The room is not tracked, already deleted or being deleted.
    Gone,
    /// The last member of a temporary room left and this caller won the
    /// right to run the cascade. Handed out at most once per room.
    CascadeClaimed,
}

/// In-memory membership of one room. Only the decision of who is in and
/// who runs the cascade happens under the lock; storage I/O never does.
#[derive(Debug)]
struct Membership {
    is_temporary: bool,
    active: BTreeSet<UserId>,
    empty_since: Option<Millis>,
    deleting: bool,
}

#[derive(Default)]
struct Members {
    rooms: HashMap<RoomId, Membership>,
    /// Deleted rooms and when, kept until a racing lookup can no longer
    /// resurrect their membership.
    deleted: HashMap<RoomId, Millis>,
}

/// Room records (durable) plus active membership (ephemeral).
#[derive(Clone)]
pub struct RoomStore {
    pool: SqlitePool,
    clock: SharedClock,
    config: Arc<CoreConfig>,
    members: Arc<Mutex<Members>>,
}

impl RoomStore {
    pub fn new(pool: SqlitePool, clock: SharedClock, config: Arc<CoreConfig>) -> Self {
        Self {
            pool,
            clock,
            config,
            members: Arc::new(Mutex::new(Members::default())),
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates a room. For permanent rooms the owner quota is checked in the
    /// same statement that inserts, so concurrent creations cannot overshoot.
    pub async fn create_room(&self, name: &str, owner_id: &UserId, is_temporary: bool) -> ChatResult<Room> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidName("room name is required".into()));
        }

        let id = RoomId::new();
        let created_at = self.clock.now_millis();
        let quota = self.config.permanent_room_quota;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO rooms (id,name,owner_id,created_at,is_temporary)
             SELECT ?,?,?,?,? WHERE ? OR
                (SELECT COUNT(*) FROM rooms WHERE owner_id=? AND is_temporary=0) < ?",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(owner_id.as_str())
        .bind(created_at)
        .bind(is_temporary)
        .bind(is_temporary)
        .bind(owner_id.as_str())
        .bind(quota as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Err(ChatError::QuotaExceeded { limit: quota });
        }

        let mut participants = BTreeSet::new();
        if !is_temporary {
            sqlx::query("INSERT INTO room_participants (room_id,user_id) VALUES (?,?)")
                .bind(id.to_string())
                .bind(owner_id.as_str())
                .execute(&mut *tx)
                .await?;
            participants.insert(owner_id.clone());
        }
        tx.commit().await?;

        self.members.lock().rooms.insert(
            id,
            Membership {
                is_temporary,
                active: BTreeSet::new(),
                empty_since: Some(created_at),
                deleting: false,
            },
        );
        info!(room_id = %id, owner = %owner_id, is_temporary, "room created");

        Ok(Room {
            id,
            name: name.to_owned(),
            owner_id: owner_id.clone(),
            created_at,
            is_temporary,
            active_users: BTreeSet::new(),
            participants,
        })
    }

    pub async fn get_room(&self, room_id: RoomId) -> ChatResult<Option<Room>> {
        {
            let members = self.members.lock();
            let deleting = members.rooms.get(&room_id).is_some_and(|m| m.deleting);
            if deleting || members.deleted.contains_key(&room_id) {
                return Ok(None);
            }
        }

        let row: Option<RoomRow> =
            sqlx::query_as("SELECT id,name,owner_id,created_at,is_temporary FROM rooms WHERE id=?")
                .bind(room_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// `get_room` for callers that treat absence as an error.
    pub async fn require_room(&self, room_id: RoomId) -> ChatResult<Room> {
        self.get_room(room_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))
    }

    async fn hydrate(&self, row: RoomRow) -> ChatResult<Room> {
        let id = RoomId::parse(&row.id)?;
        let participants = if row.is_temporary {
            BTreeSet::new()
        } else {
            let users: Vec<(String,)> =
                sqlx::query_as("SELECT user_id FROM room_participants WHERE room_id=? ORDER BY user_id")
                    .bind(&row.id)
                    .fetch_all(&self.pool)
                    .await?;
            users.into_iter().map(|(u,)| UserId::new(u)).collect()
        };

        Ok(Room {
            id,
            name: row.name,
            owner_id: UserId::new(row.owner_id),
            created_at: row.created_at,
            is_temporary: row.is_temporary,
            active_users: self.active_users(id),
            participants,
        })
    }

    /// Makes sure membership for the room is tracked in memory.
    async fn track(&self, room_id: RoomId) -> ChatResult<bool> {
        {
            let members = self.members.lock();
            if members.deleted.contains_key(&room_id) {
                return Err(ChatError::NotFound(format!("room {room_id}")));
            }
            if let Some(m) = members.rooms.get(&room_id) {
                return Ok(m.is_temporary);
            }
        }

        let (is_temporary,): (bool,) = sqlx::query_as("SELECT is_temporary FROM rooms WHERE id=?")
            .bind(room_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))?;

        let now = self.clock.now_millis();
        let mut members = self.members.lock();
        if members.deleted.contains_key(&room_id) {
            return Err(ChatError::NotFound(format!("room {room_id}")));
        }
        let m = members.rooms.entry(room_id).or_insert_with(|| Membership {
            is_temporary,
            active: BTreeSet::new(),
            empty_since: Some(now),
            deleting: false,
        });
        Ok(m.is_temporary)
    }

    /// Idempotently marks `user_id` active. Joining a permanent room also
    /// records the user as a participant, which is never undone by leaving.
    pub async fn join(&self, room_id: RoomId, user_id: &UserId) -> ChatResult<()> {
        let is_temporary = self.track(room_id).await?;

        let newly_active = {
            let mut members = self.members.lock();
            let m = members
                .rooms
                .get_mut(&room_id)
                .filter(|m| !m.deleting)
                .ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))?;
            m.empty_since = None;
            m.active.insert(user_id.clone())
        };

        if !is_temporary {
            let persisted = sqlx::query(
                "INSERT OR IGNORE INTO room_participants (room_id,user_id)
                 SELECT ?,? WHERE EXISTS (SELECT 1 FROM rooms WHERE id=?)",
            )
            .bind(room_id.to_string())
            .bind(user_id.as_str())
            .bind(room_id.to_string())
            .execute(&self.pool)
            .await;

            if let Err(e) = persisted {
                if newly_active {
                    let now = self.clock.now_millis();
                    let mut members = self.members.lock();
                    if let Some(m) = members.rooms.get_mut(&room_id) {
                        m.active.remove(user_id);
                        if m.active.is_empty() {
                            m.empty_since = Some(now);
                        }
                    }
                }
                return Err(e.into());
            }
        }

        debug!(room_id = %room_id, user_id = %user_id, "joined");
        Ok(())
    }

    /// Idempotently removes `user_id` from the active set. Emptying a
    /// temporary room claims its cascade for exactly one caller.
    pub fn leave(&self, room_id: RoomId, user_id: &UserId) -> LeaveOutcome {
        let now = self.clock.now_millis();
        let mut members = self.members.lock();
        let Some(m) = members.rooms.get_mut(&room_id) else {
            return LeaveOutcome::Gone;
        };
        if m.deleting {
            return LeaveOutcome::Gone;
        }

        let removed = m.active.remove(user_id);
        if !m.active.is_empty() {
            debug!(room_id = %room_id, user_id = %user_id, removed, "left");
            return LeaveOutcome::Left;
        }
        m.empty_since.get_or_insert(now);
        if removed && m.is_temporary {
            m.deleting = true;
            debug!(room_id = %room_id, user_id = %user_id, "last member left temporary room");
            return LeaveOutcome::CascadeClaimed;
        }
        LeaveOutcome::Left
    }

    /// Claims a room for deletion regardless of occupancy. False if someone
    /// else already holds the claim.
    pub(crate) fn claim_deletion(&self, room_id: RoomId, is_temporary: bool) -> bool {
        let mut members = self.members.lock();
        if members.deleted.contains_key(&room_id) {
            return false;
        }
        let m = members.rooms.entry(room_id).or_insert_with(|| Membership {
            is_temporary,
            active: BTreeSet::new(),
            empty_since: None,
            deleting: false,
        });
        if m.deleting {
            return false;
        }
        m.deleting = true;
        true
    }

    /// Claims an empty temporary room that has stayed empty since `cutoff`.
    pub(crate) fn claim_if_abandoned(&self, room_id: RoomId, created_at: Millis, cutoff: Millis) -> bool {
        let mut members = self.members.lock();
        if members.deleted.contains_key(&room_id) {
            return false;
        }
        match members.rooms.get_mut(&room_id) {
            None => {
                if created_at > cutoff {
                    return false;
                }
                members.rooms.insert(
                    room_id,
                    Membership {
                        is_temporary: true,
                        active: BTreeSet::new(),
                        empty_since: Some(created_at),
                        deleting: true,
                    },
                );
                true
            }
            Some(m) => {
                let quiet = m.empty_since.is_some_and(|since| since <= cutoff);
                if m.deleting || !m.is_temporary || !m.active.is_empty() || !quiet {
                    return false;
                }
                m.deleting = true;
                true
            }
        }
    }

    /// The cascade failed; the room is live again and may be claimed later.
    pub(crate) fn release_claim(&self, room_id: RoomId) {
        if let Some(m) = self.members.lock().rooms.get_mut(&room_id) {
            m.deleting = false;
        }
    }

    /// The cascade succeeded; membership is dropped for good.
    pub(crate) fn forget(&self, room_id: RoomId) -> BTreeSet<UserId> {
        let now = self.clock.now_millis();
        let mut members = self.members.lock();
        members.deleted.insert(room_id, now);
        members.rooms.remove(&room_id).map(|m| m.active).unwrap_or_default()
    }

    /// Drops tombstones of rooms deleted before `cutoff`. Lookups of those
    /// rooms fall through to storage, which no longer has them.
    pub(crate) fn prune_tombstones(&self, cutoff: Millis) -> usize {
        let mut members = self.members.lock();
        let before = members.deleted.len();
        members.deleted.retain(|_, deleted_at| *deleted_at > cutoff);
        before - members.deleted.len()
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> (usize, usize) {
        let members = self.members.lock();
        (members.rooms.len(), members.deleted.len())
    }

    pub fn active_users(&self, room_id: RoomId) -> BTreeSet<UserId> {
        self.members
            .lock()
            .rooms
            .get(&room_id)
            .map(|m| m.active.clone())
            .unwrap_or_default()
    }

    pub async fn count_permanent_rooms(&self, owner_id: &UserId) -> ChatResult<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM rooms WHERE owner_id=? AND is_temporary=0")
                .bind(owner_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    /// Permanent rooms created by `owner_id`, newest first.
    pub async fn permanent_rooms_of(&self, owner_id: &UserId) -> ChatResult<Vec<Room>> {
        let rows: Vec<RoomRow> = sqlx::query_as(
            "SELECT id,name,owner_id,created_at,is_temporary FROM rooms
             WHERE owner_id=? AND is_temporary=0 ORDER BY created_at DESC",
        )
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }

    /// Permanent rooms `user_id` joined but does not own, newest first.
    pub async fn participating_rooms(&self, user_id: &UserId) -> ChatResult<Vec<Room>> {
        let rows: Vec<RoomRow> = sqlx::query_as(
            "SELECT r.id,r.name,r.owner_id,r.created_at,r.is_temporary FROM rooms r
             JOIN room_participants p ON p.room_id=r.id
             WHERE p.user_id=? AND r.owner_id<>? AND r.is_temporary=0
             ORDER BY r.created_at DESC",
        )
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }

    async fn hydrate_all(&self, rows: Vec<RoomRow>) -> ChatResult<Vec<Room>> {
        let mut rooms = Vec::with_capacity(rows.len());
        for row in rows {
            rooms.push(self.hydrate(row).await?);
        }
        Ok(rooms)
    }

    /// Temporary rooms created before `grace` ago; candidates for collection.
    pub(crate) async fn stale_temporary_rooms(&self, grace: Duration) -> ChatResult<Vec<(RoomId, Millis, Millis)>> {
        let cutoff = self.clock.now_millis() - millis(grace);
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT id,created_at FROM rooms WHERE is_temporary=1 AND created_at<=?")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id, created_at)| Ok((RoomId::parse(&id)?, created_at, cutoff)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;

    async fn store() -> (RoomStore, Arc<ManualClock>) {
        let pool = db::connect_in_memory().await.unwrap();
        let clock = ManualClock::new(1_000);
        (RoomStore::new(pool, clock.clone(), Arc::new(CoreConfig::default())), clock)
    }

    #[tokio::test]
    async fn permanent_quota_is_two() {
        let (store, clock) = store().await;
        let owner = UserId::from("owner");
        store.create_room("one", &owner, false).await.unwrap();
        clock.advance(Duration::from_millis(1));
        store.create_room("two", &owner, false).await.unwrap();

        let err = store.create_room("three", &owner, false).await.unwrap_err();
        assert_eq!(err, ChatError::QuotaExceeded { limit: 2 });

        let rooms = store.permanent_rooms_of(&owner).await.unwrap();
        assert_eq!(rooms.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["two", "one"]);

        // Temporary rooms are not counted.
        store.create_room("scratch", &owner, true).await.unwrap();
        assert_eq!(store.count_permanent_rooms(&owner).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let (store, _) = store().await;
        let err = store.create_room("   ", &"o".into(), true).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidName(_)));
    }

    #[tokio::test]
    async fn participants_start_with_owner_for_permanent_rooms_only() {
        let (store, _) = store().await;
        let owner = UserId::from("owner");
        let permanent = store.create_room("p", &owner, false).await.unwrap();
        let temporary = store.create_room("t", &owner, true).await.unwrap();
        assert_eq!(permanent.participants, BTreeSet::from([owner.clone()]));
        assert!(temporary.participants.is_empty());
    }

    #[tokio::test]
    async fn joining_permanent_room_records_participant_forever() {
        let (store, _) = store().await;
        let owner = UserId::from("owner");
        let bob = UserId::from("bob");
        let room = store.create_room("p", &owner, false).await.unwrap();

        store.join(room.id, &bob).await.unwrap();
        store.join(room.id, &bob).await.unwrap();
        assert_eq!(store.active_users(room.id), BTreeSet::from([bob.clone()]));

        assert_eq!(store.leave(room.id, &bob), LeaveOutcome::Left);
        let room = store.require_room(room.id).await.unwrap();
        assert!(room.active_users.is_empty());
        assert!(room.participants.contains(&bob));

        let joined = store.participating_rooms(&bob).await.unwrap();
        assert_eq!(joined.len(), 1);
        assert!(store.participating_rooms(&owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_leave_of_temporary_room_claims_cascade_once() {
        let (store, _) = store().await;
        let room = store.create_room("t", &"o".into(), true).await.unwrap();
        store.join(room.id, &"a".into()).await.unwrap();
        store.join(room.id, &"b".into()).await.unwrap();

        assert_eq!(store.leave(room.id, &"a".into()), LeaveOutcome::Left);
        assert_eq!(store.leave(room.id, &"b".into()), LeaveOutcome::CascadeClaimed);
        assert_eq!(store.leave(room.id, &"b".into()), LeaveOutcome::Gone);
        assert!(store.get_room(room.id).await.unwrap().is_none());
        assert!(store.join(room.id, &"c".into()).await.is_err());
    }

    #[tokio::test]
    async fn join_unknown_room_is_not_found() {
        let (store, _) = store().await;
        let err = store.join(RoomId::new(), &"a".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
