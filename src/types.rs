// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared data model: stream identity, version tokens, paging cursors and
//! change items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest page size a change query may request.
pub const MAX_PAGE_SIZE: u32 = 5000;

/// Column holding a record's last-modification timestamp.
///
/// Required in the projection whenever a `modified_since` floor is applied.
pub const MODIFIED_ON_COLUMN: &str = "modifiedon";

/// Identity of one synchronization stream.
///
/// At most one traversal per key may be active cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    /// Caller-chosen name for the consumer of this stream.
    pub changes_key: String,
    /// Logical name of the entity type the stream is scoped to.
    pub entity_type: String,
}

impl StreamKey {
    pub fn new(changes_key: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            changes_key: changes_key.into(),
            entity_type: entity_type.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.changes_key, self.entity_type)
    }
}

/// Opaque server-issued marker for a change-log position.
///
/// `None` at a use site means "begin a full history traversal".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataVersionToken(pub String);

impl DataVersionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DataVersionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DataVersionToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DataVersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of the next page within one traversal.
///
/// Only meaningful relative to the [`DataVersionToken`] it was captured under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingCursor {
    /// 1-based page number.
    pub page_number: u32,
    /// Page size, 1..=[`MAX_PAGE_SIZE`].
    pub page_size: u32,
    /// Continuation marker returned by the previous page, if any.
    pub paging_cookie: Option<String>,
}

impl PagingCursor {
    /// First page of a traversal.
    pub fn first_page(page_size: u32) -> Self {
        Self {
            page_number: 1,
            page_size,
            paging_cookie: None,
        }
    }

    /// Cursor for the page following this one.
    pub fn advance(&self, paging_cookie: Option<String>) -> Self {
        Self {
            page_number: self.page_number.saturating_add(1),
            page_size: self.page_size,
            paging_cookie,
        }
    }
}

/// Column projection for a change query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSet {
    /// Every column of the entity.
    #[default]
    All,
    /// Only the named columns.
    Columns(Vec<String>),
}

impl ColumnSet {
    pub fn columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Columns(names.into_iter().map(Into::into).collect())
    }

    /// Whether the projection yields the given column.
    pub fn includes(&self, column: &str) -> bool {
        match self {
            Self::All => true,
            Self::Columns(cols) => cols.iter().any(|c| c.eq_ignore_ascii_case(column)),
        }
    }

    /// Returns the projection with `column` added if it is not already present.
    pub fn with_column(mut self, column: &str) -> Self {
        if let Self::Columns(ref mut cols) = self {
            if !cols.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                cols.push(column.to_string());
            }
        }
        self
    }
}

/// Identity of a single remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub entity_type: String,
    pub id: String,
}

impl RecordId {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Snapshot of a record's projected columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

/// One change reported by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeItem {
    /// Record created or updated; `modified_at` is `None` when the
    /// projection did not carry the modification timestamp.
    NewOrUpdated {
        record: Record,
        modified_at: Option<DateTime<Utc>>,
    },
    /// Record removed or deleted.
    RemovedOrDeleted { id: RecordId },
}

impl ChangeItem {
    /// Identity of the record this change affects.
    pub fn record_id(&self) -> &RecordId {
        match self {
            Self::NewOrUpdated { record, .. } => &record.id,
            Self::RemovedOrDeleted { id } => id,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Self::RemovedOrDeleted { .. })
    }
}

/// One yielded batch: the surviving changes of a single fetched page.
pub type ChangeBatch = Vec<ChangeItem>;
