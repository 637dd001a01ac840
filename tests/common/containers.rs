// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for lock integration tests.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container.
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis instance acting as the shared lock backend.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self { container, url }
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Current lease token stored under a lock key.
    pub async fn lease_owner(&self, key: &str) -> redis::RedisResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(key).await
    }

    /// Remaining lease time in milliseconds (-2 when the key is absent).
    pub async fn lease_pttl(&self, key: &str) -> redis::RedisResult<i64> {
        let mut conn = self.conn().await?;
        redis::cmd("PTTL").arg(key).query_async(&mut conn).await
    }

    /// Plant a lease as if another node held the lock.
    pub async fn plant_lease(&self, key: &str, owner: &str, ttl_ms: u64) -> redis::RedisResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
    }

    /// Delete a lease behind its holder's back.
    pub async fn steal_lease(&self, key: &str) -> redis::RedisResult<()> {
        let mut conn = self.conn().await?;
        conn.del(key).await
    }
}
