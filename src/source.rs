// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change source integration trait.
//!
//! Defines the interface for a remote system that exposes paged,
//! token-versioned change queries. The engine only ever talks to the remote
//! through [`ChangeSource`], which keeps it testable with scripted sources and
//! independent of any particular vendor API.
//!
//! # Example
//!
//! ```rust,no_run
//! use change_feed_sync::source::{ChangeSource, FetchRequest, Page, SourceFuture};
//!
//! struct MyBackend { /* ... */ }
//!
//! impl ChangeSource for MyBackend {
//!     fn fetch_changes(&self, request: FetchRequest) -> SourceFuture<'_, Page> {
//!         Box::pin(async move {
//!             // Issue the remote query for `request` here.
//!             Ok(Page::last(Vec::new(), "token-1"))
//!         })
//!     }
//! }
//! ```

use crate::types::{ChangeItem, ColumnSet, DataVersionToken, PagingCursor, MAX_PAGE_SIZE};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Result type for change source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Type alias for boxed async futures returned by a [`ChangeSource`].
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = SourceResult<T>> + Send + 'a>>;

/// Failure signalled by a change source.
///
/// The first three variants are recovered inside the engine and never reach
/// the caller while recovery is possible.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The data version token is no longer valid; a full resync is required.
    #[error("data version token is stale")]
    StaleVersionToken,

    /// Server or client ran short of memory or resources processing a page.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The remote asked the caller to back off before retrying.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Request rejected by the remote as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other remote failure.
    #[error("remote failure: {0}")]
    Remote(String),
}

impl SourceError {
    /// Whether the engine has a local recovery path for this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StaleVersionToken | Self::ResourceExhausted(_) | Self::RateLimited { .. }
        )
    }

    /// Whether a later attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }
}

/// Parameters of one change query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub entity_type: String,
    pub columns: ColumnSet,
    pub data_version_token: Option<DataVersionToken>,
    pub page_number: u32,
    pub page_size: u32,
    pub paging_cookie: Option<String>,
}

impl FetchRequest {
    pub fn new(
        entity_type: &str,
        columns: &ColumnSet,
        data_version_token: Option<&DataVersionToken>,
        cursor: &PagingCursor,
    ) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            columns: columns.clone(),
            data_version_token: data_version_token.cloned(),
            page_number: cursor.page_number,
            page_size: cursor.page_size,
            paging_cookie: cursor.paging_cookie.clone(),
        }
    }

    /// Check the request against the change query limits.
    ///
    /// Sources should call this before issuing any remote call.
    pub fn validate(&self) -> SourceResult<()> {
        validate_page_size(self.page_size).map_err(SourceError::InvalidRequest)?;
        if self.page_number == 0 {
            return Err(SourceError::InvalidRequest(
                "page number must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check that a page size lies in 1..=[`MAX_PAGE_SIZE`].
pub fn validate_page_size(page_size: u32) -> std::result::Result<(), String> {
    if page_size == 0 {
        return Err("page size must be at least 1".to_string());
    }
    if page_size > MAX_PAGE_SIZE {
        return Err(format!(
            "page size {} exceeds the maximum of {}",
            page_size, MAX_PAGE_SIZE
        ));
    }
    Ok(())
}

/// One page of a change query response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub changes: Vec<ChangeItem>,
    /// More pages are available under the current token.
    pub more_records: bool,
    /// Token to resume from once this traversal is exhausted.
    pub next_data_version_token: DataVersionToken,
    /// Cookie for requesting the following page.
    pub next_paging_cookie: Option<String>,
}

impl Page {
    /// A page that has more pages after it.
    pub fn more(
        changes: Vec<ChangeItem>,
        next_data_version_token: impl Into<DataVersionToken>,
        next_paging_cookie: impl Into<String>,
    ) -> Self {
        Self {
            changes,
            more_records: true,
            next_data_version_token: next_data_version_token.into(),
            next_paging_cookie: Some(next_paging_cookie.into()),
        }
    }

    /// The final page of a traversal.
    pub fn last(changes: Vec<ChangeItem>, next_data_version_token: impl Into<DataVersionToken>) -> Self {
        Self {
            changes,
            more_records: false,
            next_data_version_token: next_data_version_token.into(),
            next_paging_cookie: None,
        }
    }
}

/// Trait defining what we need from a remote change-tracked system.
///
/// Implementations issue exactly one remote query per call and map vendor
/// failures onto [`SourceError`]. Retrying is the engine's job.
pub trait ChangeSource: Send + Sync + 'static {
    /// Fetch one page of changes.
    fn fetch_changes(&self, request: FetchRequest) -> SourceFuture<'_, Page>;
}

impl<T: ChangeSource + ?Sized> ChangeSource for std::sync::Arc<T> {
    fn fetch_changes(&self, request: FetchRequest) -> SourceFuture<'_, Page> {
        (**self).fetch_changes(request)
    }
}
