// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed engine.
//!
//! Ties together:
//! - The remote via [`crate::source::ChangeSource`]
//! - Position persistence via [`crate::journal::JournalStore`]
//! - Single-writer enforcement via [`crate::lock::DistributedLock`]
//!
//! # Lifecycle of one invocation
//!
//! 1. Validate the request (page size, identity) before touching anything
//! 2. Take the stream lock; if another holder is active, end with no batches
//! 3. Load the journal row and decide between resume and fresh start
//! 4. Fetch pages in order, recovering stale tokens, resource exhaustion
//!    and rate limits locally
//! 5. Filter and roll up each page, yield non-empty batches
//! 6. Journal the next position before each following fetch, and the new
//!    token once the remote reports no more records
//!
//! The lock is released on every exit path, including dropping the stream.

mod request;
mod traversal;

pub use request::ChangeFeedRequest;
pub use traversal::TraversalState;

use crate::config::{FeedConfig, SloConfig};
use crate::error::{FeedError, Result};
use crate::journal::{JournalStore, SqliteJournal};
use crate::lock::{lock_key, DistributedLock, LockProvider};
use crate::resilience::{RateLimitConfig, RateLimiter};
use crate::source::ChangeSource;
use crate::types::{ChangeBatch, PagingCursor};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use traversal::Traversal;

/// Lazy stream of change batches for one invocation.
///
/// Nothing happens until it is polled. Dropping it mid-traversal releases the
/// lock and leaves the journal at the last recorded position.
pub type ChangeStream = BoxStream<'static, Result<ChangeBatch>>;

const DEFAULT_KEY_PREFIX: &str = "change-feed-sync:stream";

/// Incremental, resumable change synchronization for many streams.
///
/// One engine serves any number of stream keys; each call to
/// [`stream_changes()`](Self::stream_changes) runs one traversal for one key.
pub struct ChangeFeedEngine<S, J = SqliteJournal, L = LockProvider> {
    source: Arc<S>,
    journal: Arc<J>,
    lock: Arc<L>,

    /// Recorded as the journal's last writer.
    host_identity: Arc<str>,

    key_prefix: String,

    /// Zero means a single non-blocking attempt.
    acquire_timeout: Duration,

    /// Client-side fetch pacing shared by all traversals.
    rate_limiter: Option<Arc<RateLimiter>>,

    slo: SloConfig,
}

impl<S, J, L> Clone for ChangeFeedEngine<S, J, L> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            journal: Arc::clone(&self.journal),
            lock: Arc::clone(&self.lock),
            host_identity: Arc::clone(&self.host_identity),
            key_prefix: self.key_prefix.clone(),
            acquire_timeout: self.acquire_timeout,
            rate_limiter: self.rate_limiter.clone(),
            slo: self.slo.clone(),
        }
    }
}

impl<S: ChangeSource> ChangeFeedEngine<S, SqliteJournal, LockProvider> {
    /// Build an engine from configuration.
    ///
    /// Opens the SQLite journal and connects the configured lock backend.
    pub async fn from_config(config: &FeedConfig, source: Arc<S>) -> Result<Self> {
        if config.host_identity.trim().is_empty() {
            return Err(FeedError::Config("host_identity must not be empty".to_string()));
        }

        let journal = SqliteJournal::from_config(&config.journal).await?;
        let lock = LockProvider::from_config(config).await?;

        let mut engine = Self::new(source, Arc::new(journal), Arc::new(lock), &config.host_identity)
            .with_key_prefix(&config.lock.key_prefix)
            .with_acquire_timeout(config.lock.acquire_timeout_duration())
            .with_slo(config.slo.clone());

        if let Some(rate) = config.throttle.rate_limit_config() {
            engine = engine.with_rate_limit(rate);
        }

        info!(
            host = %config.host_identity,
            journal = %config.journal.sqlite_path,
            lock_backend = ?config.lock.backend,
            throttled = config.throttle.enabled,
            "Change feed engine ready"
        );
        Ok(engine)
    }
}

impl<S, J, L> ChangeFeedEngine<S, J, L>
where
    S: ChangeSource,
    J: JournalStore,
    L: DistributedLock,
{
    pub fn new(source: Arc<S>, journal: Arc<J>, lock: Arc<L>, host_identity: &str) -> Self {
        Self {
            source,
            journal,
            lock,
            host_identity: Arc::from(host_identity),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            acquire_timeout: Duration::ZERO,
            rate_limiter: None,
            slo: SloConfig::default(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limiter = Some(Arc::new(RateLimiter::new(config)));
        self
    }

    pub fn with_slo(mut self, slo: SloConfig) -> Self {
        self.slo = slo;
        self
    }

    pub fn journal(&self) -> &Arc<J> {
        &self.journal
    }

    pub fn host_identity(&self) -> &str {
        &self.host_identity
    }

    /// Lock key used for a request's stream.
    pub fn lock_key_for(&self, request: &ChangeFeedRequest) -> String {
        lock_key(&self.key_prefix, &request.stream_key)
    }

    /// Stream the changes for one stream key.
    ///
    /// Invalid requests fail here, before the lock is taken or anything is
    /// fetched. Everything else happens lazily as the stream is polled.
    ///
    /// The stream ends without batches when another holder owns the stream.
    /// It yields an error and ends when the remote fails in a way that cannot
    /// be recovered locally, or when the journal or lock backend fails.
    pub fn stream_changes(
        &self,
        request: ChangeFeedRequest,
        cancel: CancellationToken,
    ) -> Result<ChangeStream> {
        request.validate()?;

        let span = info_span!(
            "change_feed",
            changes_key = %request.stream_key.changes_key,
            entity_type = %request.stream_key.entity_type,
        );

        let traversal = Traversal {
            source: Arc::clone(&self.source),
            journal: Arc::clone(&self.journal),
            lock: Arc::clone(&self.lock),
            rate_limiter: self.rate_limiter.clone(),
            slo: self.slo.clone(),
            host_identity: Arc::clone(&self.host_identity),
            lock_key: self.lock_key_for(&request),
            acquire_timeout: self.acquire_timeout,
            cancel,
            columns: request.effective_columns(),
            modified_since: request.modified_since,
            roll_up_changes: request.roll_up_changes,
            requested_page_size: request.page_size,
            cursor: PagingCursor::first_page(request.page_size),
            stream_key: request.stream_key,
            state: TraversalState::Locking,
            guard: None,
            token: None,
            pending: None,
            retry_after: Duration::ZERO,
            pages_fetched: 0,
        };

        let stream = stream::unfold((traversal, span), |(mut traversal, span)| async move {
            let item = traversal.next_batch().instrument(span.clone()).await;
            item.map(|batch| (batch, (traversal, span)))
        });

        Ok(stream.boxed())
    }
}
