// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change journal persistence.
//!
//! The journal is the only durable cross-invocation state: one row per
//! [`StreamKey`] recording the data version token and the position of the
//! next page to fetch. Rows are upserted, never deleted.
//!
//! # Atomic Upsert
//!
//! Every write is a single `INSERT .. ON CONFLICT DO UPDATE`, never a
//! read-then-write, so repeated writes and crash/restart races are safe.
//! All non-key columns are overwritten unconditionally.
//!
//! # Cursor Semantics
//!
//! The journal stores the **next** page to fetch, written before that page
//! is requested:
//!
//! ```text
//! fetch page N → yield batch N → journal (page N+1) → fetch page N+1
//!                 (crash here = re-fetch page N, at-least-once)
//! ```
//!
//! When a traversal is exhausted the cursor columns are cleared and only the
//! new data token is kept.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with capped exponential backoff.

use crate::config::JournalConfig;
use crate::error::{FeedError, Result};
use crate::types::{DataVersionToken, PagingCursor, StreamKey};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Type alias for boxed async futures returned by a [`JournalStore`].
pub type JournalFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_journal_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// A stored journal row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeJournal {
    pub stream_key: StreamKey,
    pub data_token: Option<DataVersionToken>,
    /// Position of the next page; `None` after a completed traversal.
    pub cursor: Option<PagingCursor>,
    pub last_updated: DateTime<Utc>,
    /// Host identity of the last writer.
    pub last_updated_by: String,
}

impl ChangeJournal {
    /// Page size recorded with the cursor, if a traversal is in progress.
    pub fn page_size(&self) -> Option<u32> {
        self.cursor.as_ref().map(|c| c.page_size)
    }

    /// Whether the row marks a finished traversal (token kept, cursor cleared).
    pub fn is_completed(&self) -> bool {
        self.cursor.is_none()
    }
}

/// A single journal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub stream_key: StreamKey,
    pub data_token: Option<DataVersionToken>,
    pub cursor: Option<PagingCursor>,
    pub who: String,
    pub when: DateTime<Utc>,
}

impl JournalEntry {
    /// Mid-traversal position: the next page to fetch under `data_token`.
    pub fn in_progress(
        stream_key: &StreamKey,
        data_token: Option<&DataVersionToken>,
        cursor: &PagingCursor,
        who: &str,
    ) -> Self {
        Self {
            stream_key: stream_key.clone(),
            data_token: data_token.cloned(),
            cursor: Some(cursor.clone()),
            who: who.to_string(),
            when: Utc::now(),
        }
    }

    /// Exhausted traversal: new token kept, cursor cleared.
    pub fn completed(stream_key: &StreamKey, data_token: &DataVersionToken, who: &str) -> Self {
        Self {
            stream_key: stream_key.clone(),
            data_token: Some(data_token.clone()),
            cursor: None,
            who: who.to_string(),
            when: Utc::now(),
        }
    }
}

/// Durable checkpoint store for stream positions.
pub trait JournalStore: Send + Sync + 'static {
    /// Atomically insert or overwrite the row for `entry.stream_key`.
    fn upsert(&self, entry: JournalEntry) -> JournalFuture<'_, ()>;

    /// Read the row for a stream, if one was ever written.
    fn get(&self, stream_key: &StreamKey) -> JournalFuture<'_, Option<ChangeJournal>>;
}

impl<T: JournalStore + ?Sized> JournalStore for std::sync::Arc<T> {
    fn upsert(&self, entry: JournalEntry) -> JournalFuture<'_, ()> {
        (**self).upsert(entry)
    }

    fn get(&self, stream_key: &StreamKey) -> JournalFuture<'_, Option<ChangeJournal>> {
        (**self).get(stream_key)
    }
}

type JournalRow = (
    String,
    String,
    Option<String>,
    i64,
    String,
    Option<i64>,
    Option<i64>,
    Option<String>,
);

/// Journal store backed by SQLite.
pub struct SqliteJournal {
    pool: SqlitePool,
    path: String,
}

impl SqliteJournal {
    /// Open (or create) the journal at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, true).await
    }

    /// Open the journal described by a [`JournalConfig`].
    pub async fn from_config(config: &JournalConfig) -> Result<Self> {
        Self::open(&config.sqlite_path, config.wal_mode).await
    }

    async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing change journal");

        let journal_mode = if wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| FeedError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_journal (
                changes_key TEXT NOT NULL,
                entity_logical_name TEXT NOT NULL,
                data_token TEXT,
                last_updated INTEGER NOT NULL,
                last_updated_by TEXT NOT NULL,
                next_query_page_number INTEGER,
                next_query_page_size INTEGER,
                next_query_paging_cookie TEXT,
                PRIMARY KEY (changes_key, entity_logical_name)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM change_journal")
            .fetch_one(&pool)
            .await?
            .try_get("n")?;
        if count > 0 {
            info!(count, "Found journaled streams from previous runs");
        }

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// All journal rows (for diagnostics).
    pub async fn list(&self) -> Result<Vec<ChangeJournal>> {
        let pool = &self.pool;
        let rows: Vec<JournalRow> = execute_with_retry("journal_list", || async {
            sqlx::query_as(
                r#"
                SELECT changes_key, entity_logical_name, data_token, last_updated,
                       last_updated_by, next_query_page_number, next_query_page_size,
                       next_query_paging_cookie
                FROM change_journal
                ORDER BY changes_key, entity_logical_name
                "#,
            )
            .fetch_all(pool)
            .await
        })
        .await?;

        rows.into_iter().map(row_to_journal).collect()
    }

    async fn upsert_entry(&self, entry: JournalEntry) -> Result<()> {
        let pool = &self.pool;
        let (page_number, page_size, cookie) = match &entry.cursor {
            Some(c) => (
                Some(i64::from(c.page_number)),
                Some(i64::from(c.page_size)),
                c.paging_cookie.clone(),
            ),
            None => (None, None, None),
        };
        let token = entry.data_token.as_ref().map(|t| t.0.clone());
        let when = entry.when.timestamp_millis();

        let result = execute_with_retry("journal_upsert", || async {
            sqlx::query(
                r#"
                INSERT INTO change_journal (
                    changes_key, entity_logical_name, data_token, last_updated,
                    last_updated_by, next_query_page_number, next_query_page_size,
                    next_query_paging_cookie
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(changes_key, entity_logical_name) DO UPDATE SET
                    data_token = excluded.data_token,
                    last_updated = excluded.last_updated,
                    last_updated_by = excluded.last_updated_by,
                    next_query_page_number = excluded.next_query_page_number,
                    next_query_page_size = excluded.next_query_page_size,
                    next_query_paging_cookie = excluded.next_query_paging_cookie
                "#,
            )
            .bind(&entry.stream_key.changes_key)
            .bind(&entry.stream_key.entity_type)
            .bind(&token)
            .bind(when)
            .bind(&entry.who)
            .bind(page_number)
            .bind(page_size)
            .bind(&cookie)
            .execute(pool)
            .await
        })
        .await;

        crate::metrics::record_journal_write(&entry.stream_key.entity_type, result.is_ok());
        result?;

        debug!(
            stream = %entry.stream_key,
            page_number = ?page_number,
            page_size = ?page_size,
            completed = entry.cursor.is_none(),
            "Journal updated"
        );
        Ok(())
    }

    async fn get_entry(&self, stream_key: &StreamKey) -> Result<Option<ChangeJournal>> {
        let pool = &self.pool;
        let row: Option<JournalRow> = execute_with_retry("journal_get", || async {
            sqlx::query_as(
                r#"
                SELECT changes_key, entity_logical_name, data_token, last_updated,
                       last_updated_by, next_query_page_number, next_query_page_size,
                       next_query_paging_cookie
                FROM change_journal
                WHERE changes_key = ? AND entity_logical_name = ?
                "#,
            )
            .bind(&stream_key.changes_key)
            .bind(&stream_key.entity_type)
            .fetch_optional(pool)
            .await
        })
        .await?;

        row.map(row_to_journal).transpose()
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("journal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the connection pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Change journal closed");
    }
}

impl JournalStore for SqliteJournal {
    fn upsert(&self, entry: JournalEntry) -> JournalFuture<'_, ()> {
        Box::pin(self.upsert_entry(entry))
    }

    fn get(&self, stream_key: &StreamKey) -> JournalFuture<'_, Option<ChangeJournal>> {
        let stream_key = stream_key.clone();
        Box::pin(async move { self.get_entry(&stream_key).await })
    }
}

fn row_to_journal(row: JournalRow) -> Result<ChangeJournal> {
    let (changes_key, entity_type, token, last_updated, who, page_number, page_size, cookie) = row;

    let last_updated = DateTime::<Utc>::from_timestamp_millis(last_updated).ok_or_else(|| {
        FeedError::Internal(format!("journal timestamp out of range: {}", last_updated))
    })?;

    let cursor = match (page_number, page_size) {
        (Some(number), Some(size)) => Some(PagingCursor {
            page_number: to_u32("next_query_page_number", number)?,
            page_size: to_u32("next_query_page_size", size)?,
            paging_cookie: cookie,
        }),
        _ => None,
    };

    Ok(ChangeJournal {
        stream_key: StreamKey::new(changes_key, entity_type),
        data_token: token.map(DataVersionToken),
        cursor,
        last_updated,
        last_updated_by: who,
    })
}

fn to_u32(column: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| FeedError::Internal(format!("journal column {} out of range: {}", column, value)))
}
