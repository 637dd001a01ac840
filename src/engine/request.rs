// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parameters of one change feed invocation.

use crate::error::{FeedError, Result};
use crate::source::validate_page_size;
use crate::types::{ColumnSet, StreamKey, MAX_PAGE_SIZE, MODIFIED_ON_COLUMN};
use chrono::{DateTime, Utc};

/// What to stream: the stream identity plus query and post-processing options.
///
/// ```rust
/// use change_feed_sync::engine::ChangeFeedRequest;
/// use change_feed_sync::types::ColumnSet;
///
/// let request = ChangeFeedRequest::new("crm-export", "account")
///     .columns(ColumnSet::columns(["name", "revenue"]))
///     .page_size(1000)
///     .roll_up_changes(true);
/// assert_eq!(request.page_size, 1000);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeedRequest {
    pub stream_key: StreamKey,
    pub columns: ColumnSet,
    /// Drop new/updated items modified before this instant.
    pub modified_since: Option<DateTime<Utc>>,
    /// Requested page size, 1..=5000. Defaults to the maximum.
    pub page_size: u32,
    /// Keep only the last change per record within each page.
    pub roll_up_changes: bool,
}

impl ChangeFeedRequest {
    pub fn new(changes_key: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            stream_key: StreamKey::new(changes_key, entity_type),
            columns: ColumnSet::All,
            modified_since: None,
            page_size: MAX_PAGE_SIZE,
            roll_up_changes: false,
        }
    }

    pub fn columns(mut self, columns: ColumnSet) -> Self {
        self.columns = columns;
        self
    }

    pub fn modified_since(mut self, floor: DateTime<Utc>) -> Self {
        self.modified_since = Some(floor);
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn roll_up_changes(mut self, roll_up: bool) -> Self {
        self.roll_up_changes = roll_up;
        self
    }

    /// Reject requests that must never reach the lock or the remote.
    pub fn validate(&self) -> Result<()> {
        if self.stream_key.changes_key.is_empty() {
            return Err(FeedError::Config("changes key must not be empty".to_string()));
        }
        if self.stream_key.entity_type.is_empty() {
            return Err(FeedError::Config("entity type must not be empty".to_string()));
        }
        validate_page_size(self.page_size).map_err(FeedError::Config)?;
        if let ColumnSet::Columns(cols) = &self.columns {
            if cols.is_empty() && self.modified_since.is_none() {
                return Err(FeedError::Config("column projection must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// The projection actually sent to the remote.
    ///
    /// A `modified_since` floor needs the modification timestamp, so it is
    /// added when a narrowed projection leaves it out.
    pub fn effective_columns(&self) -> ColumnSet {
        if self.modified_since.is_some() && !self.columns.includes(MODIFIED_ON_COLUMN) {
            self.columns.clone().with_column(MODIFIED_ON_COLUMN)
        } else {
            self.columns.clone()
        }
    }
}
