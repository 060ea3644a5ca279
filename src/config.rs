//! Runtime configuration.
//!
//! `Config` is what `main` reads from the environment (a `.env` file works
//! too); `CoreConfig` carries the timing and quota rules the core enforces.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Permanent rooms a single owner may hold at once.
    pub permanent_room_quota: usize,
    /// A typing signal without renewal is dropped after this long.
    pub typing_ttl: Duration,
    /// Hard upper bound: older signals are never reported, swept or not.
    pub typing_staleness: Duration,
    /// Lifetime of a destructive message.
    pub destructive_ttl: Duration,
    /// Consecutive messages from one sender closer than this share a group.
    pub group_gap: Duration,
    /// Buffered events per room before slow subscribers have to catch up
    /// from storage.
    pub feed_capacity: usize,
    /// Subscriptions without a heartbeat for this long are reaped.
    pub heartbeat_timeout: Duration,
    /// Temporary rooms that stay empty this long are collected.
    pub empty_room_grace: Duration,
    /// How long a deleted room is remembered in memory after its cascade.
    pub tombstone_retention: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            permanent_room_quota: 2,
            typing_ttl: Duration::from_secs(3),
            typing_staleness: Duration::from_secs(5),
            destructive_ttl: Duration::from_secs(10),
            group_gap: Duration::from_secs(5 * 60),
            feed_capacity: 256,
            heartbeat_timeout: Duration::from_secs(30),
            empty_room_grace: Duration::from_secs(60),
            tombstone_retention: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub blob_endpoint: Option<String>,
    pub blob_token: Option<String>,
    pub sweep_interval: Duration,
    pub session_inactivity: time::Duration,
    pub core: CoreConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let mut core = CoreConfig::default();
        core.heartbeat_timeout = Duration::from_secs(var_or("HEARTBEAT_TIMEOUT_SECS", 30));
        core.empty_room_grace = Duration::from_secs(var_or("EMPTY_ROOM_GRACE_SECS", 60));

        Self {
            database_url: dotenv::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://emberchat.db?mode=rwc".to_owned()),
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            blob_endpoint: dotenv::var("BLOB_ENDPOINT").ok(),
            blob_token: dotenv::var("BLOB_TOKEN").ok(),
            sweep_interval: period_millis(var_or("SWEEP_INTERVAL_MS", 1000)),
            session_inactivity: time::Duration::minutes(var_or("SESSION_INACTIVITY_MINS", 60)),
            core,
        }
    }
}

/// Timer periods must be non-zero; `0` means "as often as possible".
fn period_millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    match dotenv::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            default
        }),
        Err(_) => default,
    }
}
