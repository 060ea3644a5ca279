use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::clock::{Millis, SharedClock, millis};
use crate::id::{RoomId, UserId};

/// One client connection. A user with two tabs has two sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle for one subscription's hold on room membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(u64);

struct Lease {
    session: SessionId,
    room_id: RoomId,
    user_id: UserId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    next: u64,
    leases: HashMap<LeaseId, Lease>,
    last_seen: HashMap<SessionId, Millis>,
}

impl Registry {
    fn holds(&self, room_id: RoomId, user_id: &UserId) -> bool {
        self.leases
            .values()
            .any(|l| l.room_id == room_id && l.user_id == *user_id)
    }

    fn forget_idle_session(&mut self, session: SessionId) {
        if !self.leases.values().any(|l| l.session == session) {
            self.last_seen.remove(&session);
        }
    }
}

/// Liveness bookkeeping for subscriptions. Membership in a room is
/// refcounted per user, so the user only leaves when their last live
/// subscription to it goes away, whether by unsubscribe, disconnect, or a
/// missed heartbeat.
#[derive(Clone)]
pub struct SessionRegistry {
    clock: SharedClock,
    inner: Arc<Mutex<Registry>>,
}

impl SessionRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn attach(&self, session: SessionId, room_id: RoomId, user_id: &UserId) -> (LeaseId, CancellationToken) {
        let now = self.clock.now_millis();
        let cancel = CancellationToken::new();
        let mut inner = self.inner.lock();
        inner.next += 1;
        let lease = LeaseId(inner.next);
        inner.leases.insert(
            lease,
            Lease {
                session,
                room_id,
                user_id: user_id.clone(),
                cancel: cancel.clone(),
            },
        );
        inner.last_seen.insert(session, now);
        (lease, cancel)
    }

    /// Records a sign of life from `session`.
    pub fn touch(&self, session: SessionId) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        if let Some(seen) = inner.last_seen.get_mut(&session) {
            *seen = now;
        }
    }

    /// Drops a lease. Returns the membership to release when this was the
    /// user's last hold on the room; `None` if others remain or the lease
    /// was already reaped.
    pub fn detach(&self, lease: LeaseId) -> Option<(RoomId, UserId)> {
        let mut inner = self.inner.lock();
        let removed = inner.leases.remove(&lease)?;
        inner.forget_idle_session(removed.session);
        (!inner.holds(removed.room_id, &removed.user_id)).then_some((removed.room_id, removed.user_id))
    }

    /// Cancels every subscription of sessions silent for `timeout` and
    /// returns the memberships that no live subscription holds any more.
    pub fn reap(&self, timeout: Duration) -> Vec<(RoomId, UserId)> {
        let cutoff = self.clock.now_millis() - millis(timeout);
        let mut inner = self.inner.lock();

        let dead: Vec<SessionId> = inner
            .last_seen
            .iter()
            .filter(|(_, seen)| **seen <= cutoff)
            .map(|(session, _)| *session)
            .collect();
        if dead.is_empty() {
            return Vec::new();
        }

        let mut released = BTreeSet::new();
        inner.leases.retain(|_, lease| {
            if !dead.contains(&lease.session) {
                return true;
            }
            warn!(session = %lease.session, room_id = %lease.room_id, user_id = %lease.user_id, "reaping silent session");
            lease.cancel.cancel();
            released.insert((lease.room_id, lease.user_id.clone()));
            false
        });
        for session in dead {
            inner.last_seen.remove(&session);
        }

        released
            .into_iter()
            .filter(|(room_id, user_id)| !inner.holds(*room_id, user_id))
            .collect()
    }

    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn second_tab_keeps_user_in_room() {
        let registry = SessionRegistry::new(ManualClock::new(0));
        let room = RoomId::new();
        let alice = UserId::from("alice");

        let (tab1, _) = registry.attach(SessionId::new(), room, &alice);
        let (tab2, _) = registry.attach(SessionId::new(), room, &alice);

        assert_eq!(registry.detach(tab1), None);
        assert_eq!(registry.detach(tab2), Some((room, alice)));
        assert_eq!(registry.detach(tab2), None);
    }

    #[test]
    fn silent_session_is_reaped_and_cancelled() {
        let clock = ManualClock::new(0);
        let registry = SessionRegistry::new(clock.clone());
        let room = RoomId::new();
        let quiet = SessionId::new();
        let chatty = SessionId::new();

        let (lease, cancel) = registry.attach(quiet, room, &"ghost".into());
        registry.attach(chatty, room, &"alive".into());

        clock.advance(Duration::from_secs(20));
        registry.touch(chatty);
        clock.advance(Duration::from_secs(15));

        let reaped = registry.reap(Duration::from_secs(30));
        assert_eq!(reaped, vec![(room, UserId::from("ghost"))]);
        assert!(cancel.is_cancelled());
        assert_eq!(registry.lease_count(), 1);

        // The stream ending afterwards must not leave a second time.
        assert_eq!(registry.detach(lease), None);
    }
}
