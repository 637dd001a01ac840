//! Scripted ChangeSource for testing.
//!
//! Replays a queue of responses (pages or failures) and records every
//! request for assertions. When the script runs dry it answers with a
//! remote failure, so a test that over-fetches fails loudly instead of
//! hanging.

use super::events::{Event, EventLog};
use change_feed_sync::source::{ChangeSource, FetchRequest, Page, SourceError, SourceFuture, SourceResult};
use change_feed_sync::types::{ChangeItem, Record, RecordId};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Mock implementation of ChangeSource that replays a script.
///
/// # Example
/// ```rust,ignore
/// let source = ScriptedSource::new()
///     .then_page(Page::more(vec![upsert("account", "1")], "t1", "c1"))
///     .then_error(SourceError::StaleVersionToken)
///     .then_page(Page::last(vec![], "t2"));
///
/// // Run the engine...
///
/// assert_eq!(source.requests().len(), 3);
/// ```
pub struct ScriptedSource {
    script: Mutex<VecDeque<SourceResult<Page>>>,
    requests: Mutex<Vec<FetchRequest>>,
    events: Option<EventLog>,
    /// Simulated remote latency.
    latency: Option<Duration>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            events: None,
            latency: None,
        }
    }

    /// Record each fetch in a shared event log.
    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn then_page(self, page: Page) -> Self {
        self.push(Ok(page));
        self
    }

    pub fn then_error(self, error: SourceError) -> Self {
        self.push(Err(error));
        self
    }

    /// Append a response after construction (e.g. between two invocations).
    pub fn push(&self, response: SourceResult<Page>) {
        self.script.lock().unwrap().push_back(response);
    }

    /// All requests received so far, in order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSource for ScriptedSource {
    fn fetch_changes(&self, request: FetchRequest) -> SourceFuture<'_, Page> {
        if let Some(events) = &self.events {
            events.push(Event::Fetch {
                page_number: request.page_number,
                page_size: request.page_size,
                token: request.data_version_token.as_ref().map(|t| t.0.clone()),
            });
        }
        self.requests.lock().unwrap().push(request);
        let response = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::Remote("script exhausted".to_string())));
        let latency = self.latency;

        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            response
        })
    }
}

// =============================================================================
// Change item helpers
// =============================================================================

/// A new/updated item without a modification timestamp.
pub fn upsert(entity_type: &str, id: &str) -> ChangeItem {
    ChangeItem::NewOrUpdated {
        record: Record::new(RecordId::new(entity_type, id)),
        modified_at: None,
    }
}

/// A new/updated item stamped at `at`, carrying a `version` attribute.
pub fn upsert_at(entity_type: &str, id: &str, at: DateTime<Utc>, version: i64) -> ChangeItem {
    ChangeItem::NewOrUpdated {
        record: Record::new(RecordId::new(entity_type, id)).with_attribute("version", version.into()),
        modified_at: Some(at),
    }
}

pub fn removal(entity_type: &str, id: &str) -> ChangeItem {
    ChangeItem::RemovedOrDeleted {
        id: RecordId::new(entity_type, id),
    }
}

/// `n` distinct upserts numbered from `start`.
pub fn upserts(entity_type: &str, start: usize, n: usize) -> Vec<ChangeItem> {
    (start..start + n)
        .map(|i| upsert(entity_type, &i.to_string()))
        .collect()
}
