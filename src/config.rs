//! Configuration for the change feed engine.
//!
//! Configuration is passed to
//! [`ChangeFeedEngine::from_config()`](crate::ChangeFeedEngine::from_config)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use change_feed_sync::config::{FeedConfig, LockBackend};
//!
//! let mut config = FeedConfig::for_testing("worker-1");
//! config.lock.backend = LockBackend::Redis;
//! config.lock.redis_url = Some("redis://locks:6379".into());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! FeedConfig
//! ├── host_identity: String     # Written to the journal's last_updated_by
//! ├── journal: JournalConfig    # SQLite journal location
//! ├── lock: LockConfig          # Single-writer lock backend
//! ├── throttle: ThrottleConfig  # Client-side fetch pacing
//! └── slo: SloConfig            # Slow fetch threshold
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! host_identity: "sync-worker-03"
//!
//! journal:
//!   sqlite_path: "/var/lib/app/change_journal.db"
//!
//! lock:
//!   backend: redis
//!   redis_url: "redis://locks:6379"
//!   lease_ttl: "30s"
//!
//! throttle:
//!   enabled: true
//!   requests_per_sec: 20
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ChangeFeedEngine::from_config()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Identity of this host, recorded as the journal's last writer.
    /// Supplied explicitly so it never depends on ambient process state.
    pub host_identity: String,

    /// Journal persistence settings.
    #[serde(default)]
    pub journal: JournalConfig,

    /// Distributed lock settings.
    #[serde(default)]
    pub lock: LockConfig,

    /// Client-side fetch pacing.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Latency thresholds.
    #[serde(default)]
    pub slo: SloConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host_identity: "local.dev.host.default".to_string(),
            journal: JournalConfig::default(),
            lock: LockConfig::default(),
            throttle: ThrottleConfig::default(),
            slo: SloConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(host_identity: &str) -> Self {
        Self {
            host_identity: host_identity.to_string(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JournalConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Journal persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Path to the SQLite database holding the change journal.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "change_journal.db".to_string(),
            wal_mode: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LockConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Which lock implementation guards stream traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// In-process only; correct for a single node.
    #[default]
    Local,
    /// Redis lease, shared by every node pointing at the same Redis.
    Redis,
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub backend: LockBackend,

    /// Redis URL, required for the Redis backend.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every lock key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Lease length as a duration string (e.g., "30s").
    /// The lease is renewed while the traversal runs.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    /// How long to wait for the lock before giving up (e.g., "0s").
    /// Zero means a single non-blocking attempt.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: String,
}

fn default_key_prefix() -> String {
    "change-feed-sync:stream".to_string()
}

fn default_lease_ttl() -> String {
    "30s".to_string()
}

fn default_acquire_timeout() -> String {
    "0s".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            redis_url: None,
            key_prefix: default_key_prefix(),
            lease_ttl: default_lease_ttl(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl LockConfig {
    /// Parse the lease_ttl string to a Duration.
    pub fn lease_ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.lease_ttl).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the acquire_timeout string to a Duration.
    pub fn acquire_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.acquire_timeout).unwrap_or(Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ThrottleConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Client-side fetch pacing.
///
/// Independent of server-directed rate limiting: this keeps many streams
/// started at once from stampeding the remote in the first place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Sustained fetches per second.
    #[serde(default = "default_requests_per_sec")]
    pub requests_per_sec: u32,

    /// Fetches allowed in a burst above the sustained rate.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_requests_per_sec() -> u32 {
    10
}

fn default_burst() -> u32 {
    5
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_sec: 10,
            burst: 5,
        }
    }
}

impl ThrottleConfig {
    /// Create rate limit configuration from throttle settings.
    ///
    /// Returns `None` if throttling is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.burst,
                refill_rate: self.requests_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Latency threshold for flagging slow remote fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Fetches slower than this log a warning (ms).
    #[serde(default = "default_max_fetch_latency_ms")]
    pub max_fetch_latency_ms: u64,
}

fn default_max_fetch_latency_ms() -> u64 {
    10_000
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_fetch_latency_ms: 10_000,
        }
    }
}

impl SloConfig {
    /// Check if a fetch latency violates SLO.
    pub fn is_fetch_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_fetch_latency_ms
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
