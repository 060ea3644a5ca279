use std::sync::Arc;

use sqlx::SqlitePool;

use crate::blob::BlobStore;
use crate::clock::SharedClock;
use crate::config::CoreConfig;
use crate::identity::Identity;
use crate::messages::MessageLog;
use crate::presence::PresenceTracker;
use crate::rooms::{Lifecycle, RoomStore};

use super::registry::SessionRegistry;
use super::session::ClientSession;

/// Every core component, wired once and passed around explicitly.
#[derive(Clone)]
pub struct Hub {
    pub rooms: RoomStore,
    pub log: MessageLog,
    pub presence: PresenceTracker,
    pub lifecycle: Lifecycle,
    pub sessions: SessionRegistry,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) clock: SharedClock,
    config: Arc<CoreConfig>,
}

impl Hub {
    pub fn new(pool: SqlitePool, blobs: Arc<dyn BlobStore>, clock: SharedClock, config: CoreConfig) -> Self {
        let config = Arc::new(config);
        let rooms = RoomStore::new(pool.clone(), clock.clone(), config.clone());
        let log = MessageLog::new(pool, clock.clone(), config.clone());
        let presence = PresenceTracker::new(rooms.clone(), clock.clone(), config.clone());
        let lifecycle = Lifecycle::new(rooms.clone(), log.clone(), presence.clone(), clock.clone());
        Self {
            sessions: SessionRegistry::new(clock.clone()),
            rooms,
            log,
            presence,
            lifecycle,
            blobs,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Opens a session for one client connection.
    pub fn connect(&self, identity: Identity) -> ClientSession {
        ClientSession::new(self.clone(), identity)
    }
}
