// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the change feed engine.
//!
//! Errors are categorized by their source (change source, SQLite journal,
//! Redis lock) and carry enough context to debug a failed traversal.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Source` | Depends | Remote failure the engine could not recover locally |
//! | `Lock` | Yes | Lock backend unreachable (not contention, which is silent) |
//! | `Journal` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Invalid request or configuration, rejected before any remote call |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Recovered Locally
//!
//! Stale version tokens, transient resource exhaustion and rate limiting are
//! handled inside the engine and never reach the caller as errors (see
//! [`SourceError::is_recoverable()`](crate::source::SourceError::is_recoverable)).
//! Whatever is surfaced here leaves the journal at the last position that was
//! fully reached, so a later invocation resumes from there.

use crate::source::SourceError;
use thiserror::Error;

/// Result type alias for change feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Errors surfaced to callers of the change feed engine.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Invalid request or configuration.
    ///
    /// Raised before the lock is taken or any remote call is issued
    /// (e.g. a page size above 5000). Not retryable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite error while reading or writing the change journal.
    #[error("Journal error: {0}")]
    Journal(#[from] sqlx::Error),

    /// Distributed lock backend failure.
    ///
    /// Contention is never reported through this variant; it only covers
    /// the backend itself being unavailable.
    #[error("Lock error ({key}): {message}")]
    Lock {
        key: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Change source failure that was not recovered locally.
    #[error("Change source error: {0}")]
    Source(#[from] SourceError),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FeedError {
    /// Create a lock error from a redis::RedisError
    pub fn lock(key: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Lock {
            key: key.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a lock error without source
    pub fn lock_msg(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lock {
            key: key.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable by a fresh invocation
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source(e) => e.is_transient(),
            Self::Lock { .. } => true,
            Self::Journal(_) => false,
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }
}
