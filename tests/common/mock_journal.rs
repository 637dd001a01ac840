//! Journal doubles for testing.
//!
//! - [`MemoryJournal`]: in-memory `JournalStore` for tests that don't care
//!   about SQLite
//! - [`RecordingJournal`]: wraps any store, records every upsert and can
//!   be told to fail writes

use super::events::{Event, EventLog};
use change_feed_sync::error::FeedError;
use change_feed_sync::journal::{ChangeJournal, JournalEntry, JournalFuture, JournalStore};
use change_feed_sync::types::StreamKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Journal kept in a HashMap, with the same overwrite-all-columns semantics.
#[derive(Default)]
pub struct MemoryJournal {
    rows: Mutex<HashMap<StreamKey, ChangeJournal>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing the engine.
    pub fn seed(&self, entry: JournalEntry) {
        self.rows
            .lock()
            .unwrap()
            .insert(entry.stream_key.clone(), to_row(entry));
    }

    pub fn row(&self, key: &StreamKey) -> Option<ChangeJournal> {
        self.rows.lock().unwrap().get(key).cloned()
    }
}

fn to_row(entry: JournalEntry) -> ChangeJournal {
    ChangeJournal {
        stream_key: entry.stream_key,
        data_token: entry.data_token,
        cursor: entry.cursor,
        last_updated: entry.when,
        last_updated_by: entry.who,
    }
}

impl JournalStore for MemoryJournal {
    fn upsert(&self, entry: JournalEntry) -> JournalFuture<'_, ()> {
        self.seed(entry);
        Box::pin(async { Ok(()) })
    }

    fn get(&self, stream_key: &StreamKey) -> JournalFuture<'_, Option<ChangeJournal>> {
        let row = self.row(stream_key);
        Box::pin(async move { Ok(row) })
    }
}

/// Wraps a journal store and records every upsert.
pub struct RecordingJournal<J> {
    inner: J,
    writes: Mutex<Vec<JournalEntry>>,
    events: Option<EventLog>,
    fail_writes: AtomicBool,
}

impl<J: JournalStore> RecordingJournal<J> {
    pub fn new(inner: J) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
            events: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Make every following upsert fail (without reaching the inner store).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful upserts, in order.
    pub fn writes(&self) -> Vec<JournalEntry> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn inner(&self) -> &J {
        &self.inner
    }
}

impl<J: JournalStore> JournalStore for RecordingJournal<J> {
    fn upsert(&self, entry: JournalEntry) -> JournalFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(FeedError::Internal("injected journal failure".to_string()));
            }
            if let Some(events) = &self.events {
                events.push(Event::Journal {
                    page_number: entry.cursor.as_ref().map(|c| c.page_number),
                    token: entry.data_token.as_ref().map(|t| t.0.clone()),
                });
            }
            self.writes.lock().unwrap().push(entry.clone());
            self.inner.upsert(entry).await
        })
    }

    fn get(&self, stream_key: &StreamKey) -> JournalFuture<'_, Option<ChangeJournal>> {
        self.inner.get(stream_key)
    }
}
