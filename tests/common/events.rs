//! Shared, ordered log of fetches, journal writes and consumer yields.
//!
//! The scripted source and the recording journal append to the same log,
//! and tests append `Yield` as they consume batches, so ordering between
//! the three can be asserted directly.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Fetch {
        page_number: u32,
        page_size: u32,
        token: Option<String>,
    },
    /// Journal upsert; `page_number` is `None` for a completed traversal.
    Journal {
        page_number: Option<u32>,
        token: Option<String>,
    },
    /// Consumer received a batch of `len` changes.
    Yield { len: usize },
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Index of each event matching `pred`, in order.
    pub fn positions(&self, pred: impl Fn(&Event) -> bool) -> Vec<usize> {
        self.snapshot()
            .iter()
            .enumerate()
            .filter(|(_, e)| pred(e))
            .map(|(i, _)| i)
            .collect()
    }
}
