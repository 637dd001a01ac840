// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-writer locks for stream traversals.
//!
//! Each stream key maps to one lock key. A traversal only proceeds while it
//! holds a [`LockGuard`]; a second attempt sees "unavailable" and the engine
//! finishes with zero batches.
//!
//! # Scoped Release
//!
//! The guard releases on explicit [`LockGuard::release()`] or on drop, so
//! completion, errors, cancellation and dropping a half-consumed stream all
//! give the lock back.
//!
//! A backend whose release is a network round trip hands the guard a future.
//! `release().await` runs it to completion, so the key is free once it
//! returns. Drop can't await; it spawns the future on the current runtime.
//!
//! # Backends
//!
//! - [`LocalLock`]: in-process set of held keys. Correct for one node.
//! - [`RedisLock`]: lease via `SET key token NX PX ttl`, renewed in the
//!   background at a third of the TTL. Release and renewal compare the owner
//!   token in a Lua script so an expired holder never deletes a successor's
//!   lease. If renewal finds the lease gone, the guard is marked lost.
//!
//! ```text
//! try_acquire ──► SET NX PX ──► guard ──► renew every ttl/3 ──► drop ──► DEL if owner
//!                     │
//!                     └── nil ──► None (another holder)
//! ```

use crate::config::{FeedConfig, LockBackend};
use crate::error::{FeedError, Result};
use crate::resilience::RetryConfig;
use crate::types::StreamKey;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// How often a waiting `try_acquire` re-checks an unavailable lock.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Type alias for boxed async futures returned by a [`DistributedLock`].
pub type LockFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Derive the lock key for a stream.
///
/// `\` and `:` inside the components are escaped, so two different stream
/// keys can never map to the same lock key.
pub fn lock_key(prefix: &str, stream_key: &StreamKey) -> String {
    format!(
        "{}:{}:{}",
        prefix,
        escape_component(&stream_key.entity_type),
        escape_component(&stream_key.changes_key)
    )
}

fn escape_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || c == ':' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Future performing an asynchronous release.
pub type ReleaseFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum ReleaseAction {
    Now(Box<dyn FnOnce() + Send>),
    Deferred(Box<dyn FnOnce() -> ReleaseFuture + Send>),
}

/// Held lock. Released exactly once, on [`release()`](Self::release) or drop.
pub struct LockGuard {
    key: String,
    release: Mutex<Option<ReleaseAction>>,
    lost: Option<Arc<AtomicBool>>,
}

impl LockGuard {
    /// Wrap a synchronous release action into a guard.
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self::with_action(key, ReleaseAction::Now(Box::new(release)))
    }

    /// Wrap a release that must be awaited, such as a network call.
    pub fn with_async_release(
        key: impl Into<String>,
        release: impl FnOnce() -> ReleaseFuture + Send + 'static,
    ) -> Self {
        Self::with_action(key, ReleaseAction::Deferred(Box::new(release)))
    }

    fn with_action(key: impl Into<String>, action: ReleaseAction) -> Self {
        Self {
            key: key.into(),
            release: Mutex::new(Some(action)),
            lost: None,
        }
    }

    /// Attach a flag the backend sets when the lease is lost while held.
    pub fn with_lost_flag(mut self, lost: Arc<AtomicBool>) -> Self {
        self.lost = Some(lost);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the lock is still known to be held.
    pub fn is_held(&self) -> bool {
        self.lost
            .as_ref()
            .map(|lost| !lost.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    /// Release now and wait until the backend has let go of the key.
    pub async fn release(mut self) {
        match self.take_action() {
            Some(ReleaseAction::Now(release)) => release(),
            Some(ReleaseAction::Deferred(release)) => release().await,
            None => return,
        }
        debug!(key = %self.key, "Lock released");
    }

    fn take_action(&mut self) -> Option<ReleaseAction> {
        self.release
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.take_action() {
            Some(ReleaseAction::Now(release)) => release(),
            Some(ReleaseAction::Deferred(release)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(release());
                }
                Err(_) => {
                    warn!(key = %self.key, "No runtime to release lock; lease will expire");
                    return;
                }
            },
            None => return,
        }
        debug!(key = %self.key, "Lock released on drop");
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Cluster-wide mutual exclusion keyed by string.
pub trait DistributedLock: Send + Sync + 'static {
    /// Try to take `key`, waiting at most `timeout`.
    ///
    /// `Ok(None)` means another holder is active; it is not a failure.
    /// A zero timeout makes exactly one attempt.
    fn try_acquire(&self, key: &str, timeout: Duration) -> LockFuture<'_, Option<LockGuard>>;
}

impl<T: DistributedLock + ?Sized> DistributedLock for Arc<T> {
    fn try_acquire(&self, key: &str, timeout: Duration) -> LockFuture<'_, Option<LockGuard>> {
        (**self).try_acquire(key, timeout)
    }
}

// =============================================================================
// LocalLock
// =============================================================================

/// In-process lock. Clones share the same key set.
#[derive(Clone, Default)]
pub struct LocalLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone in this process.
    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    fn try_take(&self, key: &str) -> Option<LockGuard> {
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string());
        if !inserted {
            return None;
        }

        let held = Arc::clone(&self.held);
        let owned_key = key.to_string();
        Some(LockGuard::new(key, move || {
            held.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&owned_key);
        }))
    }
}

impl DistributedLock for LocalLock {
    fn try_acquire(&self, key: &str, wait: Duration) -> LockFuture<'_, Option<LockGuard>> {
        let key = key.to_string();
        Box::pin(async move {
            let deadline = Instant::now() + wait;
            loop {
                if let Some(guard) = self.try_take(&key) {
                    return Ok(Some(guard));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(deadline - Instant::now())).await;
            }
        })
    }
}

impl fmt::Debug for LocalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .held
            .lock()
            .map(|held| held.len())
            .unwrap_or_default();
        f.debug_struct("LocalLock").field("held", &count).finish()
    }
}

// =============================================================================
// RedisLock
// =============================================================================

/// Redis-backed lease lock shared by every node using the same Redis.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    owner: String,
    lease_ttl: Duration,
    sequence: Arc<AtomicU64>,
}

impl RedisLock {
    /// Connect to Redis with retry logic.
    ///
    /// `owner` identifies this host inside lease tokens.
    pub async fn connect(
        redis_url: &str,
        owner: &str,
        lease_ttl: Duration,
        retry_config: &RetryConfig,
    ) -> Result<Self> {
        info!(url = %redis_url, "Connecting to lock backend");

        let client = Client::open(redis_url)
            .map_err(|e| FeedError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut attempt = 0;

        loop {
            attempt += 1;

            let conn_result = timeout(retry_config.connection_timeout, client.get_connection_manager()).await;

            let message = match conn_result {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        info!(attempt, "Connected to lock backend after retry");
                    } else {
                        info!("Connected to lock backend");
                    }
                    return Ok(Self::with_connection(conn, owner, lease_ttl));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "timed out after {}ms",
                    retry_config.connection_timeout.as_millis()
                ),
            };

            if attempt >= retry_config.max_attempts {
                error!(attempt, error = %message, "Failed to connect to lock backend after max retries");
                return Err(FeedError::lock_msg(
                    redis_url,
                    format!("Connection failed after {} attempts: {}", attempt, message),
                ));
            }

            let delay = retry_config.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %message,
                "Lock backend connection attempt failed, retrying"
            );

            tokio::time::sleep(delay).await;
        }
    }

    /// Build from an existing connection.
    pub fn with_connection(conn: ConnectionManager, owner: &str, lease_ttl: Duration) -> Self {
        Self {
            conn,
            owner: owner.to_string(),
            lease_ttl: lease_ttl.max(Duration::from_millis(100)),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    fn next_token(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.owner,
            std::process::id(),
            chrono::Utc::now().timestamp_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn ttl_millis(&self) -> u64 {
        self.lease_ttl.as_millis() as u64
    }

    async fn try_set(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_millis())
            .query_async(&mut conn)
            .await
            .map_err(|e| FeedError::lock(key, e))?;
        Ok(reply.is_some())
    }

    fn guard(&self, key: &str, token: String) -> LockGuard {
        let lost = Arc::new(AtomicBool::new(false));

        let renewal = tokio::spawn(renew_lease(
            self.conn.clone(),
            key.to_string(),
            token.clone(),
            self.lease_ttl,
            Arc::clone(&lost),
        ));

        let conn = self.conn.clone();
        let owned_key = key.to_string();
        LockGuard::with_async_release(key, move || {
            renewal.abort();
            Box::pin(release_lease(conn, owned_key, token))
        })
        .with_lost_flag(lost)
    }
}

impl DistributedLock for RedisLock {
    fn try_acquire(&self, key: &str, wait: Duration) -> LockFuture<'_, Option<LockGuard>> {
        let key = key.to_string();
        Box::pin(async move {
            let token = self.next_token();
            let deadline = Instant::now() + wait;
            loop {
                if self.try_set(&key, &token).await? {
                    debug!(key = %key, ttl_ms = self.ttl_millis(), "Lock acquired");
                    return Ok(Some(self.guard(&key, token)));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(deadline - Instant::now())).await;
            }
        })
    }
}

impl fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLock")
            .field("owner", &self.owner)
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

async fn renew_lease(
    mut conn: ConnectionManager,
    key: String,
    token: String,
    lease_ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let script = Script::new(EXTEND_SCRIPT);
    let interval = lease_ttl / 3;
    let ttl_ms = lease_ttl.as_millis() as u64;

    loop {
        tokio::time::sleep(interval).await;
        let renewed: redis::RedisResult<i64> = script
            .key(&key)
            .arg(&token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await;

        match renewed {
            Ok(1) => debug!(key = %key, "Lock lease renewed"),
            Ok(_) => {
                lost.store(true, Ordering::Release);
                error!(key = %key, "Lock lease lost before renewal");
                return;
            }
            Err(e) => {
                // The lease may still be valid; try again next interval.
                warn!(key = %key, error = %e, "Lock lease renewal failed");
            }
        }
    }
}

async fn release_lease(mut conn: ConnectionManager, key: String, token: String) {
    let released: redis::RedisResult<i64> = Script::new(RELEASE_SCRIPT)
        .key(&key)
        .arg(&token)
        .invoke_async(&mut conn)
        .await;

    match released {
        Ok(1) => debug!(key = %key, "Lock lease deleted"),
        Ok(_) => warn!(key = %key, "Lock lease already expired or taken over"),
        Err(e) => warn!(key = %key, error = %e, "Failed to release lock lease; it will expire"),
    }
}

// =============================================================================
// LockProvider
// =============================================================================

/// Lock backend selected by configuration.
#[derive(Debug, Clone)]
pub enum LockProvider {
    Local(LocalLock),
    Redis(RedisLock),
}

impl LockProvider {
    /// Build the backend named in `config.lock`.
    pub async fn from_config(config: &FeedConfig) -> Result<Self> {
        match config.lock.backend {
            LockBackend::Local => Ok(Self::Local(LocalLock::new())),
            LockBackend::Redis => {
                let url = config.lock.redis_url.as_deref().ok_or_else(|| {
                    FeedError::Config("lock.redis_url is required for the redis lock backend".to_string())
                })?;
                let lock = RedisLock::connect(
                    url,
                    &config.host_identity,
                    config.lock.lease_ttl_duration(),
                    &RetryConfig::startup(),
                )
                .await?;
                Ok(Self::Redis(lock))
            }
        }
    }
}

impl DistributedLock for LockProvider {
    fn try_acquire(&self, key: &str, timeout: Duration) -> LockFuture<'_, Option<LockGuard>> {
        match self {
            Self::Local(lock) => lock.try_acquire(key, timeout),
            Self::Redis(lock) => lock.try_acquire(key, timeout),
        }
    }
}
