//! # Change Feed Sync
//!
//! Incremental, crash-safe mirroring of a remote system's change feed into a
//! local consumer.
//!
//! ## Architecture
//!
//! The engine sits between a remote that exposes paged, token-versioned
//! change queries and a consumer that reads batches from a stream:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           ChangeFeedEngine                               │
//! │                                                                          │
//! │  ┌───────────────┐   ┌────────────────┐   ┌───────────────────────────┐  │
//! │  │ Lock          │──►│ Traversal      │──►│ Filter + roll-up → batch  │──┼──► consumer
//! │  │ (one writer)  │   │ (state machine)│   │ (per page)                │  │
//! │  └───────────────┘   └────────────────┘   └───────────────────────────┘  │
//! │                        │            ▲                                    │
//! │                        ▼            │                                    │
//! │                 ┌──────────────┐  ┌─┴────────────┐                       │
//! │                 │ JournalStore │  │ ChangeSource │                       │
//! │                 │ (SQLite)     │  │ (remote)     │                       │
//! │                 └──────────────┘  └──────────────┘                       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! Delivery is at-least-once. The next position is journaled only after the
//! batch before it has been handed out, so a crash re-delivers at most the
//! last batch on resume.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use change_feed_sync::{ChangeFeedEngine, ChangeFeedRequest, FeedConfig};
//! use change_feed_sync::source::{ChangeSource, FetchRequest, Page, SourceFuture};
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Remote;
//!
//! impl ChangeSource for Remote {
//!     fn fetch_changes(&self, _request: FetchRequest) -> SourceFuture<'_, Page> {
//!         Box::pin(async { Ok(Page::last(Vec::new(), "token-1")) })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> change_feed_sync::Result<()> {
//!     let config = FeedConfig::for_testing("worker-1");
//!     let engine = ChangeFeedEngine::from_config(&config, Arc::new(Remote)).await?;
//!
//!     let request = ChangeFeedRequest::new("crm-export", "account").roll_up_changes(true);
//!     let mut batches = engine.stream_changes(request, CancellationToken::new())?;
//!     while let Some(batch) = batches.next().await {
//!         println!("{} changes", batch?.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod journal;
pub mod lock;
pub mod metrics;
pub mod resilience;
pub mod source;
pub mod types;

// Re-exports for convenience
pub use config::{FeedConfig, JournalConfig, LockBackend, LockConfig, SloConfig, ThrottleConfig};
pub use engine::{ChangeFeedEngine, ChangeFeedRequest, ChangeStream, TraversalState};
pub use error::{FeedError, Result};
pub use journal::{ChangeJournal, JournalEntry, JournalStore, SqliteJournal};
pub use lock::{DistributedLock, LocalLock, LockGuard, LockProvider, RedisLock};
pub use source::{ChangeSource, FetchRequest, Page, SourceError};
pub use types::{ChangeBatch, ChangeItem, ColumnSet, DataVersionToken, PagingCursor, Record, RecordId, StreamKey};
