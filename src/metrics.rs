//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change query throughput and latency
//! - Local recovery paths (stale token, page shrink, rate-limit waits)
//! - Filtering and roll-up
//! - Lock contention
//! - Journal writes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `change_feed_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Every per-stream metric is labelled with `entity_type` only; changes keys
//! are caller-defined and unbounded, so they stay out of label sets.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one successful change query.
pub fn record_page_fetched(entity_type: &str, changes: usize, duration: Duration) {
    counter!("change_feed_pages_fetched_total", "entity_type" => entity_type.to_string()).increment(1);
    counter!("change_feed_changes_fetched_total", "entity_type" => entity_type.to_string())
        .increment(changes as u64);
    histogram!("change_feed_fetch_duration_seconds", "entity_type" => entity_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a yielded batch.
pub fn record_batch_yielded(entity_type: &str, size: usize) {
    counter!("change_feed_batches_yielded_total", "entity_type" => entity_type.to_string()).increment(1);
    counter!("change_feed_changes_yielded_total", "entity_type" => entity_type.to_string())
        .increment(size as u64);
}

/// Record items dropped by the modified-since floor and by roll-up.
pub fn record_post_processing(entity_type: &str, filtered: usize, rolled_up: usize) {
    if filtered > 0 {
        counter!("change_feed_items_filtered_total", "entity_type" => entity_type.to_string())
            .increment(filtered as u64);
    }
    if rolled_up > 0 {
        counter!("change_feed_items_rolled_up_total", "entity_type" => entity_type.to_string())
            .increment(rolled_up as u64);
    }
}

/// Record a reset to full traversal after a stale version token.
pub fn record_stale_token_reset(entity_type: &str) {
    counter!("change_feed_stale_token_resets_total", "entity_type" => entity_type.to_string()).increment(1);
}

/// Record a page-size shrink after resource exhaustion.
pub fn record_page_shrink(entity_type: &str, new_page_size: u32) {
    counter!("change_feed_page_shrinks_total", "entity_type" => entity_type.to_string()).increment(1);
    gauge!("change_feed_page_size", "entity_type" => entity_type.to_string()).set(f64::from(new_page_size));
}

/// Record a server-directed rate-limit wait.
pub fn record_rate_limit_wait(entity_type: &str, wait: Duration) {
    counter!("change_feed_rate_limit_waits_total", "entity_type" => entity_type.to_string()).increment(1);
    histogram!("change_feed_rate_limit_wait_seconds", "entity_type" => entity_type.to_string())
        .record(wait.as_secs_f64());
}

/// Record a traversal skipped because another holder owns the stream.
pub fn record_lock_contention(entity_type: &str) {
    counter!("change_feed_lock_contention_total", "entity_type" => entity_type.to_string()).increment(1);
}

/// Record the end of a traversal by outcome (`completed`, `cancelled`, `failed`).
pub fn record_traversal_end(entity_type: &str, outcome: &str) {
    counter!(
        "change_feed_traversals_total",
        "entity_type" => entity_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a journal upsert.
pub fn record_journal_write(entity_type: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "change_feed_journal_writes_total",
        "entity_type" => entity_type.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record journal SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_journal_retry(operation: &str) {
    counter!("change_feed_journal_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a fetch exceeding the configured latency threshold.
pub fn record_slo_violation(entity_type: &str, latency_ms: u64) {
    counter!("change_feed_slo_violations_total", "entity_type" => entity_type.to_string()).increment(1);
    histogram!("change_feed_slo_violation_latency_ms", "entity_type" => entity_type.to_string())
        .record(latency_ms as f64);
}
