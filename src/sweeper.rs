//! The presence tick: one background task that expires every kind of soft
//! state the core keeps.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::client::Hub;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_messages: usize,
    pub expired_typing: usize,
    pub reaped_sessions: usize,
    pub collected_rooms: usize,
    pub pruned_tombstones: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    hub: Hub,
}

impl Sweeper {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    /// One pass. Failures are logged and retried on the next tick.
    pub async fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.hub.log.expire_all_destructive().await {
            Ok(n) => report.expired_messages = n,
            Err(e) => warn!(error = %e, "destructive sweep failed"),
        }

        report.expired_typing = self.hub.presence.expire_stale();

        let ghosts = self.hub.sessions.reap(self.hub.config().heartbeat_timeout);
        report.reaped_sessions = ghosts.len();
        for (room_id, user_id) in ghosts {
            if let Err(e) = self.hub.lifecycle.leave(room_id, &user_id).await {
                warn!(room_id = %room_id, user_id = %user_id, error = %e, "releasing ghost membership failed");
            }
        }

        match self.hub.lifecycle.collect_abandoned(self.hub.config().empty_room_grace).await {
            Ok(n) => report.collected_rooms = n,
            Err(e) => warn!(error = %e, "abandoned room sweep failed"),
        }

        report.pruned_tombstones = self.hub.lifecycle.prune_tombstones(self.hub.config().tombstone_retention);

        if report != SweepReport::default() {
            debug!(?report, "sweep");
        }
        report
    }

    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}
