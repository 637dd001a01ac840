//! Fuzz target for per-page post-processing.
//!
//! Filters and rolls up arbitrary pages and checks that neither step
//! panics, invents identities, or leaves duplicates behind.

#![no_main]

use change_feed_sync::filter::{apply_modified_since, roll_up};
use change_feed_sync::types::{ChangeItem, Record, RecordId};
use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use std::collections::HashSet;

fuzz_target!(|data: (Vec<(u8, bool, Option<i32>)>, Option<i32>)| {
    let (raw, floor) = data;

    let items: Vec<ChangeItem> = raw
        .into_iter()
        .map(|(id, removal, at)| {
            let id = RecordId::new("account", id.to_string());
            if removal {
                ChangeItem::RemovedOrDeleted { id }
            } else {
                ChangeItem::NewOrUpdated {
                    record: Record::new(id),
                    modified_at: at.and_then(|s| Utc.timestamp_opt(i64::from(s), 0).single()),
                }
            }
        })
        .collect();
    let floor = floor.and_then(|s| Utc.timestamp_opt(i64::from(s), 0).single());

    let input_ids: HashSet<RecordId> = items.iter().map(|i| i.record_id().clone()).collect();

    let filtered = apply_modified_since(items, floor);
    assert!(filtered.iter().all(|i| input_ids.contains(i.record_id())));

    let rolled = roll_up(filtered.clone());
    let rolled_ids: HashSet<&RecordId> = rolled.iter().map(|i| i.record_id()).collect();
    assert_eq!(rolled_ids.len(), rolled.len());

    let filtered_ids: HashSet<&RecordId> = filtered.iter().map(|i| i.record_id()).collect();
    assert_eq!(rolled_ids, filtered_ids);
});
