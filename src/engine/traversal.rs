// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The traversal state machine behind one change stream.
//!
//! Each poll of the stream drives [`Traversal::next_batch()`] until it either
//! has a batch to hand out or reaches a terminal state:
//!
//! ```text
//!                 ┌─────────────── unavailable ──────────────────┐
//!                 │                                              ▼
//! Locking ──► CursorLoad ──► Querying ──(more=false)──► Completing ──► Done
//!                             │ ▲ │ ▲
//!                             │ │ │ └── yield batch, journal, next page
//!                             ▼ │ └──── StaleRecovery (token reset)
//!                    BackoffShrink /
//!                    RateLimitWait
//! ```
//!
//! A position write is never issued in the same poll as the batch it follows.
//! It is parked in `pending` and flushed at the start of the next poll, just
//! before the next fetch. A consumer that stops after a batch therefore never
//! records progress past it, and a restart re-delivers that batch.
//!
//! The lease is checked before that flush: once the lock is lost, the parked
//! write is discarded, since the row now belongs to the new holder.
//!
//! On every exit except dropping the stream, the lock release is awaited
//! before the stream ends, so an immediate re-run on the same node can take
//! the lock again.

use crate::config::SloConfig;
use crate::error::{FeedError, Result};
use crate::filter::{apply_modified_since, roll_up};
use crate::journal::{JournalEntry, JournalStore};
use crate::lock::{DistributedLock, LockGuard};
use crate::metrics;
use crate::resilience::RateLimiter;
use crate::source::{ChangeSource, FetchRequest, Page, SourceError};
use crate::types::{ChangeBatch, ColumnSet, DataVersionToken, PagingCursor, StreamKey};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a traversal is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    /// Waiting to take the stream's lock.
    Locking,
    /// Lock held; reading the journal row.
    CursorLoad,
    /// Fetching pages.
    Querying,
    /// Token rejected as stale; resetting to a full traversal.
    StaleRecovery,
    /// Remote ran out of resources; halving the page size.
    BackoffShrink,
    /// Waiting out a server-directed rate limit before the identical request.
    RateLimitWait,
    /// Final page delivered; terminal token not yet journaled.
    Completing,
    /// Finished, cancelled, failed, or lock unavailable.
    Done,
}

impl std::fmt::Display for TraversalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraversalState::Locking => write!(f, "Locking"),
            TraversalState::CursorLoad => write!(f, "CursorLoad"),
            TraversalState::Querying => write!(f, "Querying"),
            TraversalState::StaleRecovery => write!(f, "StaleRecovery"),
            TraversalState::BackoffShrink => write!(f, "BackoffShrink"),
            TraversalState::RateLimitWait => write!(f, "RateLimitWait"),
            TraversalState::Completing => write!(f, "Completing"),
            TraversalState::Done => write!(f, "Done"),
        }
    }
}

/// Outcome of one fetch, before any recovery.
enum Fetched {
    Page(Page),
    Stale,
    Exhausted,
    RateLimited(Duration),
    Cancelled,
}

pub(crate) struct Traversal<S, J, L> {
    pub(crate) source: Arc<S>,
    pub(crate) journal: Arc<J>,
    pub(crate) lock: Arc<L>,
    pub(crate) rate_limiter: Option<Arc<RateLimiter>>,
    pub(crate) slo: SloConfig,
    pub(crate) host_identity: Arc<str>,
    pub(crate) lock_key: String,
    pub(crate) acquire_timeout: Duration,
    pub(crate) cancel: CancellationToken,

    pub(crate) stream_key: StreamKey,
    pub(crate) columns: ColumnSet,
    pub(crate) modified_since: Option<DateTime<Utc>>,
    pub(crate) roll_up_changes: bool,
    pub(crate) requested_page_size: u32,

    pub(crate) state: TraversalState,
    pub(crate) guard: Option<LockGuard>,
    /// Token the current traversal was started under.
    pub(crate) token: Option<DataVersionToken>,
    pub(crate) cursor: PagingCursor,
    /// Position write deferred until the next poll.
    pub(crate) pending: Option<JournalEntry>,
    /// Server-directed delay for `RateLimitWait`.
    pub(crate) retry_after: Duration,
    pub(crate) pages_fetched: u64,
}

impl<S, J, L> Traversal<S, J, L>
where
    S: ChangeSource,
    J: JournalStore,
    L: DistributedLock,
{
    /// Advance until the next batch is available or the traversal ends.
    pub(crate) async fn next_batch(&mut self) -> Option<Result<ChangeBatch>> {
        loop {
            match self.state {
                TraversalState::Locking => {
                    if let Err(e) = self.acquire().await {
                        return self.fail(e).await;
                    }
                }
                TraversalState::CursorLoad => {
                    if let Err(e) = self.load_cursor().await {
                        return self.fail(e).await;
                    }
                }
                TraversalState::Querying => {
                    if let Err(e) = self.ensure_held() {
                        return self.fail(e).await;
                    }
                    if let Err(e) = self.flush_pending().await {
                        return self.fail(e).await;
                    }
                    if self.cancel.is_cancelled() {
                        info!(pages = self.pages_fetched, "Traversal cancelled");
                        self.finish("cancelled").await;
                        return None;
                    }

                    match self.fetch().await {
                        Ok(Fetched::Page(page)) => {
                            if let Some(batch) = self.accept(page) {
                                return Some(Ok(batch));
                            }
                        }
                        Ok(Fetched::Stale) => self.state = TraversalState::StaleRecovery,
                        Ok(Fetched::Exhausted) => self.state = TraversalState::BackoffShrink,
                        Ok(Fetched::RateLimited(retry_after)) => {
                            self.retry_after = retry_after;
                            self.state = TraversalState::RateLimitWait;
                        }
                        Ok(Fetched::Cancelled) => {
                            info!(pages = self.pages_fetched, "Traversal cancelled during throttle");
                            self.finish("cancelled").await;
                            return None;
                        }
                        Err(e) => return self.fail(e).await,
                    }
                }
                TraversalState::StaleRecovery => {
                    if let Err(e) = self.recover_stale_token() {
                        return self.fail(e).await;
                    }
                    self.state = TraversalState::Querying;
                }
                TraversalState::BackoffShrink => {
                    self.shrink_page_size();
                    self.state = TraversalState::Querying;
                }
                TraversalState::RateLimitWait => {
                    let cancel = self.cancel.clone();
                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(self.retry_after) => false,
                    };
                    if cancelled {
                        info!(pages = self.pages_fetched, "Traversal cancelled during wait");
                        self.finish("cancelled").await;
                        return None;
                    }
                    self.state = TraversalState::Querying;
                }
                TraversalState::Completing => {
                    if let Err(e) = self.ensure_held() {
                        return self.fail(e).await;
                    }
                    if let Err(e) = self.flush_pending().await {
                        return self.fail(e).await;
                    }
                    info!(
                        pages = self.pages_fetched,
                        token = ?self.token.as_ref().map(|t| t.as_str()),
                        "Traversal complete"
                    );
                    self.finish("completed").await;
                    return None;
                }
                TraversalState::Done => return None,
            }
        }
    }

    async fn acquire(&mut self) -> Result<()> {
        match self.lock.try_acquire(&self.lock_key, self.acquire_timeout).await? {
            Some(guard) => {
                debug!(key = %self.lock_key, "Stream lock acquired");
                self.guard = Some(guard);
                self.state = TraversalState::CursorLoad;
            }
            None => {
                debug!(key = %self.lock_key, "Stream already owned elsewhere, skipping");
                metrics::record_lock_contention(&self.stream_key.entity_type);
                self.state = TraversalState::Done;
            }
        }
        Ok(())
    }

    async fn load_cursor(&mut self) -> Result<()> {
        let row = self.journal.get(&self.stream_key).await?;
        let requested = self.requested_page_size;

        match row {
            Some(row) => match row.cursor {
                Some(cursor) if cursor.page_size == requested => {
                    info!(
                        page_number = cursor.page_number,
                        page_size = cursor.page_size,
                        last_updated_by = %row.last_updated_by,
                        "Resuming traversal from journal"
                    );
                    self.token = row.data_token;
                    self.cursor = cursor;
                }
                Some(cursor) => {
                    info!(
                        recorded_page_size = cursor.page_size,
                        requested_page_size = requested,
                        "Page size changed, starting fresh traversal"
                    );
                    self.start_fresh();
                }
                None => {
                    info!(
                        has_token = row.data_token.is_some(),
                        "Catching up from last completed token"
                    );
                    self.token = row.data_token;
                    self.cursor = PagingCursor::first_page(requested);
                }
            },
            None => {
                info!(page_size = requested, "No journal entry, starting full traversal");
                self.start_fresh();
            }
        }

        self.state = TraversalState::Querying;
        Ok(())
    }

    fn start_fresh(&mut self) {
        self.token = None;
        self.cursor = PagingCursor::first_page(self.requested_page_size);
    }

    /// Fail if the lease was lost. The parked write is dropped with it.
    fn ensure_held(&mut self) -> Result<()> {
        match &self.guard {
            Some(guard) if !guard.is_held() => {
                if self.pending.take().is_some() {
                    warn!(key = %self.lock_key, "Discarding journal write after lease loss");
                }
                Err(FeedError::lock_msg(&self.lock_key, "lease lost during traversal"))
            }
            _ => Ok(()),
        }
    }

    async fn flush_pending(&mut self) -> Result<()> {
        if let Some(entry) = self.pending.take() {
            self.journal.upsert(entry).await?;
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Fetched> {
        if let Some(limiter) = self.rate_limiter.clone() {
            let cancel = self.cancel.clone();
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = limiter.acquire() => false,
            };
            if cancelled {
                return Ok(Fetched::Cancelled);
            }
        }

        let request = FetchRequest::new(
            &self.stream_key.entity_type,
            &self.columns,
            self.token.as_ref(),
            &self.cursor,
        );
        debug!(
            page_number = request.page_number,
            page_size = request.page_size,
            has_token = request.data_version_token.is_some(),
            "Fetching changes"
        );

        let started = Instant::now();
        let result = self.source.fetch_changes(request).await;
        let elapsed = started.elapsed();

        if self.slo.is_fetch_violation(elapsed) {
            warn!(
                latency_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slo.max_fetch_latency_ms,
                "Slow change query"
            );
            metrics::record_slo_violation(&self.stream_key.entity_type, elapsed.as_millis() as u64);
        }

        match result {
            Ok(page) => {
                self.pages_fetched += 1;
                metrics::record_page_fetched(&self.stream_key.entity_type, page.changes.len(), elapsed);
                Ok(Fetched::Page(page))
            }
            Err(SourceError::StaleVersionToken) => Ok(Fetched::Stale),
            Err(SourceError::ResourceExhausted(reason)) if self.cursor.page_size > 1 => {
                warn!(reason = %reason, page_size = self.cursor.page_size, "Change query exhausted resources");
                Ok(Fetched::Exhausted)
            }
            Err(SourceError::RateLimited { retry_after }) => {
                warn!(retry_after_ms = retry_after.as_millis() as u64, "Rate limited, waiting");
                metrics::record_rate_limit_wait(&self.stream_key.entity_type, retry_after);
                Ok(Fetched::RateLimited(retry_after))
            }
            Err(e) => Err(FeedError::Source(e)),
        }
    }

    fn recover_stale_token(&mut self) -> Result<()> {
        let already_fresh =
            self.token.is_none() && self.cursor.page_number == 1 && self.cursor.paging_cookie.is_none();
        if already_fresh {
            return Err(FeedError::Source(SourceError::StaleVersionToken));
        }

        warn!(
            page_number = self.cursor.page_number,
            "Data version token is stale, restarting full traversal"
        );
        metrics::record_stale_token_reset(&self.stream_key.entity_type);
        self.token = None;
        self.cursor = PagingCursor::first_page(self.cursor.page_size);
        Ok(())
    }

    /// Halve the page size and restart the traversal's pages from the first.
    fn shrink_page_size(&mut self) {
        let new_size = (self.cursor.page_size / 2).max(1);
        warn!(
            old_page_size = self.cursor.page_size,
            new_page_size = new_size,
            "Shrinking page size"
        );
        metrics::record_page_shrink(&self.stream_key.entity_type, new_size);
        self.cursor = PagingCursor::first_page(new_size);
    }

    /// Post-process a page and park the position past it.
    fn accept(&mut self, page: Page) -> Option<ChangeBatch> {
        let Page {
            changes,
            more_records,
            next_data_version_token,
            next_paging_cookie,
        } = page;

        let fetched = changes.len();
        let kept = apply_modified_since(changes, self.modified_since);
        let after_floor = kept.len();
        let batch = if self.roll_up_changes { roll_up(kept) } else { kept };
        metrics::record_post_processing(
            &self.stream_key.entity_type,
            fetched - after_floor,
            after_floor - batch.len(),
        );

        if more_records {
            self.cursor = self.cursor.advance(next_paging_cookie);
            self.pending = Some(JournalEntry::in_progress(
                &self.stream_key,
                self.token.as_ref(),
                &self.cursor,
                &self.host_identity,
            ));
        } else {
            self.pending = Some(JournalEntry::completed(
                &self.stream_key,
                &next_data_version_token,
                &self.host_identity,
            ));
            self.token = Some(next_data_version_token);
            self.state = TraversalState::Completing;
        }

        if batch.is_empty() {
            return None;
        }
        metrics::record_batch_yielded(&self.stream_key.entity_type, batch.len());
        Some(batch)
    }

    async fn fail(&mut self, err: FeedError) -> Option<Result<ChangeBatch>> {
        error!(error = %err, state = %self.state, pages = self.pages_fetched, "Traversal failed");
        self.finish("failed").await;
        Some(Err(err))
    }

    async fn finish(&mut self, outcome: &str) {
        self.state = TraversalState::Done;
        self.pending = None;
        if let Some(guard) = self.guard.take() {
            guard.release().await;
            metrics::record_traversal_end(&self.stream_key.entity_type, outcome);
        }
    }
}
