// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-page post-processing: `modified_since` floor and roll-up.
//!
//! Both operate on a single fetched page. Duplicates across pages are left
//! for the consumer to tolerate.

use crate::types::{ChangeItem, RecordId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Drop new/updated items modified strictly before `floor`.
///
/// Items stamped exactly at the floor are kept, since several changes can
/// share one timestamp. Removals always pass. An upsert without a timestamp
/// cannot be shown to meet the floor and is dropped.
pub fn apply_modified_since(items: Vec<ChangeItem>, floor: Option<DateTime<Utc>>) -> Vec<ChangeItem> {
    let Some(floor) = floor else {
        return items;
    };

    items
        .into_iter()
        .filter(|item| match item {
            ChangeItem::NewOrUpdated { modified_at, .. } => {
                modified_at.map(|at| at >= floor).unwrap_or(false)
            }
            ChangeItem::RemovedOrDeleted { .. } => true,
        })
        .collect()
}

/// Keep only the last change per record identity.
///
/// Output follows the order in which each identity first appeared in the
/// page; the surviving value is the latest change for that identity.
pub fn roll_up(items: Vec<ChangeItem>) -> Vec<ChangeItem> {
    let mut slots: HashMap<RecordId, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<ChangeItem> = Vec::with_capacity(items.len());

    for item in items {
        match slots.get(item.record_id()) {
            Some(&idx) => out[idx] = item,
            None => {
                slots.insert(item.record_id().clone(), out.len());
                out.push(item);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Record;
    use chrono::TimeZone;

    fn upsert(id: &str, at: Option<DateTime<Utc>>) -> ChangeItem {
        ChangeItem::NewOrUpdated {
            record: Record::new(RecordId::new("account", id)),
            modified_at: at,
        }
    }

    fn removal(id: &str) -> ChangeItem {
        ChangeItem::RemovedOrDeleted {
            id: RecordId::new("account", id),
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_no_floor_keeps_everything() {
        let items = vec![upsert("a", None), removal("b"), upsert("c", Some(ts(1)))];
        assert_eq!(apply_modified_since(items.clone(), None), items);
    }

    #[test]
    fn test_floor_keeps_equal_drops_earlier() {
        let floor = ts(1_000);
        let items = vec![
            upsert("early", Some(ts(999))),
            upsert("equal", Some(ts(1_000))),
            upsert("late", Some(ts(1_001))),
        ];

        let kept = apply_modified_since(items, Some(floor));
        let ids: Vec<&str> = kept.iter().map(|i| i.record_id().id.as_str()).collect();
        assert_eq!(ids, vec!["equal", "late"]);
    }

    #[test]
    fn test_floor_never_drops_removals() {
        let kept = apply_modified_since(vec![removal("gone")], Some(ts(5_000)));
        assert_eq!(kept.len(), 1);
        assert!(kept[0].is_removal());
    }

    #[test]
    fn test_floor_drops_untimestamped_upserts() {
        let kept = apply_modified_since(vec![upsert("unknown", None)], Some(ts(0)));
        assert!(kept.is_empty());
    }

    #[test]
    fn test_roll_up_keeps_last_per_identity() {
        let items = vec![
            upsert("a", Some(ts(1))),
            upsert("b", Some(ts(2))),
            upsert("a", Some(ts(3))),
            removal("a"),
        ];

        let rolled = roll_up(items);
        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled[0], removal("a"));
        assert_eq!(rolled[1], upsert("b", Some(ts(2))));
    }

    #[test]
    fn test_roll_up_distinguishes_entity_types() {
        let items = vec![
            ChangeItem::RemovedOrDeleted {
                id: RecordId::new("account", "1"),
            },
            ChangeItem::RemovedOrDeleted {
                id: RecordId::new("contact", "1"),
            },
        ];
        assert_eq!(roll_up(items).len(), 2);
    }

    #[test]
    fn test_roll_up_empty() {
        assert!(roll_up(Vec::new()).is_empty());
    }
}
