// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Redis lock backend
//!
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker / OrbStack)
//! cargo test --test integration -- --ignored
//!
//! # Run specific test
//! cargo test --test integration redis_lock -- --ignored
//! ```
//!
//! # Test Organization
//! - `redis_lock_*` - lease acquire, release, renewal and ownership
//!   (`redis_lock_connect_retries_on_failure` needs no Docker and always runs)
//! - `engine_*` - engines on two "nodes" sharing one Redis

mod common;

use change_feed_sync::config::{FeedConfig, LockBackend};
use change_feed_sync::lock::{DistributedLock, RedisLock};
use change_feed_sync::resilience::RetryConfig;
use change_feed_sync::source::Page;
use change_feed_sync::{ChangeFeedEngine, ChangeFeedRequest};
use common::{upserts, ScriptedSource, TestRedis};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::clients::Cli;
use tokio_util::sync::CancellationToken;

const KEY: &str = "change-feed-sync:stream:account:crm-export";

async fn node(url: &str, owner: &str, ttl: Duration) -> RedisLock {
    RedisLock::connect(url, owner, ttl, &RetryConfig::testing())
        .await
        .unwrap()
}

// =============================================================================
// Redis Lock Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_connects_successfully() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);

    let lock = node(&redis.url, "node-a", Duration::from_secs(30)).await;
    assert_eq!(lock.lease_ttl(), Duration::from_secs(30));
}

#[tokio::test]
async fn redis_lock_connect_retries_on_failure() {
    // Nothing listens on port 1; testing config has 3 attempts backing off 10ms then 20ms
    let config = RetryConfig::testing();
    let start = std::time::Instant::now();
    let result = RedisLock::connect("redis://127.0.0.1:1", "node-a", Duration::from_secs(30), &config).await;

    assert!(result.is_err());
    let backoff = config.delay_for_attempt(1) + config.delay_for_attempt(2);
    assert!(start.elapsed() >= backoff);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_is_exclusive_across_nodes() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let a = node(&redis.url, "node-a", Duration::from_secs(30)).await;
    let b = node(&redis.url, "node-b", Duration::from_secs(30)).await;

    let guard = a.try_acquire(KEY, Duration::ZERO).await.unwrap();
    assert!(guard.is_some());

    let other = b.try_acquire(KEY, Duration::ZERO).await.unwrap();
    assert!(other.is_none(), "second node must see the lock as unavailable");

    let owner = redis.lease_owner(KEY).await.unwrap().unwrap();
    assert!(owner.starts_with("node-a:"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_release_deletes_lease() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let a = node(&redis.url, "node-a", Duration::from_secs(30)).await;
    let b = node(&redis.url, "node-b", Duration::from_secs(30)).await;

    let guard = a.try_acquire(KEY, Duration::ZERO).await.unwrap().unwrap();
    guard.release().await;

    assert_eq!(redis.lease_owner(KEY).await.unwrap(), None);
    assert!(b.try_acquire(KEY, Duration::ZERO).await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_drop_releases_in_background() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let a = node(&redis.url, "node-a", Duration::from_secs(30)).await;

    let guard = a.try_acquire(KEY, Duration::ZERO).await.unwrap().unwrap();
    drop(guard);

    // Drop can't await; the delete runs on a spawned task
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(redis.lease_owner(KEY).await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_waits_for_release() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let a = node(&redis.url, "node-a", Duration::from_secs(30)).await;
    let b = node(&redis.url, "node-b", Duration::from_secs(30)).await;

    let guard = a.try_acquire(KEY, Duration::ZERO).await.unwrap().unwrap();
    let waiter = tokio::spawn(async move { b.try_acquire(KEY, Duration::from_secs(3)).await.unwrap().is_some() });

    tokio::time::sleep(Duration::from_millis(300)).await;
    guard.release().await;

    assert!(waiter.await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_renews_lease_while_held() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let a = node(&redis.url, "node-a", Duration::from_millis(600)).await;

    let guard = a.try_acquire(KEY, Duration::ZERO).await.unwrap().unwrap();

    // Well past the original TTL
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(guard.is_held());
    assert!(redis.lease_pttl(KEY).await.unwrap() > 0);
    assert!(redis.lease_owner(KEY).await.unwrap().unwrap().starts_with("node-a:"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_release_spares_successor() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let a = node(&redis.url, "node-a", Duration::from_secs(30)).await;

    let guard = a.try_acquire(KEY, Duration::ZERO).await.unwrap().unwrap();

    // Lease expires and another node takes over
    redis.steal_lease(KEY).await.unwrap();
    redis.plant_lease(KEY, "node-b:successor", 30_000).await.unwrap();

    guard.release().await;

    assert_eq!(
        redis.lease_owner(KEY).await.unwrap().as_deref(),
        Some("node-b:successor"),
        "release must only delete its own lease"
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_lock_marks_guard_lost() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let a = node(&redis.url, "node-a", Duration::from_millis(600)).await;

    let guard = a.try_acquire(KEY, Duration::ZERO).await.unwrap().unwrap();
    redis.steal_lease(KEY).await.unwrap();

    // At least one renewal interval (ttl/3) must pass
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!guard.is_held());
}

// =============================================================================
// Multi-Node Engine Tests
// =============================================================================

fn node_config(url: &str, host: &str, dir: &std::path::Path) -> FeedConfig {
    let mut config = FeedConfig::for_testing(host);
    config.lock.backend = LockBackend::Redis;
    config.lock.redis_url = Some(url.to_string());
    config.journal.sqlite_path = dir.join(format!("{}.db", host)).to_string_lossy().to_string();
    config
}

#[tokio::test]
#[ignore] // Requires Docker
async fn engine_second_node_skips_owned_stream() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let dir = tempfile::tempdir().unwrap();

    let source_a = Arc::new(
        ScriptedSource::new()
            .then_page(Page::more(upserts("account", 0, 2), "x", "c1"))
            .then_page(Page::last(upserts("account", 2, 2), "t1")),
    );
    let source_b = Arc::new(ScriptedSource::new().then_page(Page::last(upserts("account", 0, 2), "t1")));

    let engine_a = ChangeFeedEngine::from_config(&node_config(&redis.url, "node-a", dir.path()), Arc::clone(&source_a))
        .await
        .unwrap();
    let engine_b = ChangeFeedEngine::from_config(&node_config(&redis.url, "node-b", dir.path()), Arc::clone(&source_b))
        .await
        .unwrap();

    let request = ChangeFeedRequest::new("crm-export", "account").page_size(2);

    let mut stream_a = engine_a.stream_changes(request.clone(), CancellationToken::new()).unwrap();
    assert!(stream_a.next().await.unwrap().is_ok());

    let results_b: Vec<_> = engine_b
        .stream_changes(request.clone(), CancellationToken::new())
        .unwrap()
        .collect()
        .await;
    assert!(results_b.is_empty());
    assert_eq!(source_b.request_count(), 0);

    let rest: Vec<_> = stream_a.collect().await;
    assert_eq!(rest.len(), 1);
    assert_eq!(source_a.request_count(), 2);

    // The lease is gone as soon as the stream ends: node A runs again at once
    source_a.push(Ok(Page::last(upserts("account", 4, 1), "t2")));
    let rerun_a: Vec<_> = engine_a
        .stream_changes(request.clone(), CancellationToken::new())
        .unwrap()
        .collect()
        .await;
    assert_eq!(rerun_a.len(), 1);
    assert!(rerun_a[0].is_ok());
    assert_eq!(source_a.request_count(), 3);

    // And node B right after it
    let results_b: Vec<_> = engine_b
        .stream_changes(request, CancellationToken::new())
        .unwrap()
        .collect()
        .await;
    assert_eq!(results_b.len(), 1);
}
