// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis storage backend for the L2 tier.
//!
//! Layout inside one (optionally prefixed) keyspace:
//!
//! ```text
//! {prefix}{key}          STRING   envelope bytes, PX = entry ttl
//! {prefix}tag:{tag}      SET      unprefixed keys carrying the tag
//! {prefix}lock:{name}    STRING   fencing token, PX = lease
//! ```
//!
//! Lock release and extension are single Lua scripts so the token comparison
//! and the DEL/PEXPIRE can't interleave with another client's acquire.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, Script};
use tracing::debug;

use super::traits::{RemoteStore, StorageError, LOCK_KEY_PREFIX};
use crate::resilience::retry::{retry, RetryConfig};

const TAG_PREFIX: &str = "tag:";
const SCAN_BATCH: usize = 500;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:job:42")
    prefix: String,
    command_timeout: Duration,
    release_script: Script,
    extend_script: Script,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// The prefix is prepended to all keys, enabling namespacing when
    /// sharing a Redis instance with other applications. It also scopes
    /// [`flush`](RemoteStore::flush) to this cache's keys only.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use tiered_cache::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "myapp:job:42", "myapp:tag:job"
    /// let store = RedisStore::with_prefix("redis://localhost", Some("myapp:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Use startup config: fast-fail after a few seconds, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            command_timeout: Duration::from_secs(1),
            release_script: Script::new(COMPARE_AND_DELETE),
            extend_script: Script::new(COMPARE_AND_EXPIRE),
        })
    }

    /// Bound every command round-trip. A command that exceeds it fails with
    /// [`StorageError::Backend`] and counts as a breaker failure upstream.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Get a clone of the connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    #[inline]
    fn tag_key(&self, tag: &str) -> String {
        format!("{}{}{}", self.prefix, TAG_PREFIX, tag)
    }

    /// Await a command under the configured timeout.
    async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => {
                crate::metrics::record_timeout("L2", operation);
                Err(StorageError::Backend(format!(
                    "{} timed out after {:?}",
                    operation, self.command_timeout
                )))
            }
        }
    }

    /// Cursor-based SCAN over fully-qualified keys. Returns prefixed keys.
    async fn scan_prefixed(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "scan",
                    cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(found)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        self.run("get", conn.get(&key)).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let mut pipeline = pipe();
        pipeline.atomic();
        pipeline
            .cmd("SET")
            .arg(&prefixed)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .ignore();
        for tag in tags {
            pipeline.cmd("SADD").arg(self.tag_key(tag)).arg(key).ignore();
        }

        self.run("set", pipeline.query_async::<()>(&mut conn)).await
    }

    async fn delete(&self, keys: &[String], tags: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();

        let mut pipeline = pipe();
        pipeline.atomic();
        pipeline.del(&prefixed);
        for tag in tags {
            pipeline.cmd("SREM").arg(self.tag_key(tag)).arg(keys).ignore();
        }

        let (removed,): (u64,) = self.run("delete", pipeline.query_async(&mut conn)).await?;
        Ok(removed)
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let tag_key = self.tag_key(tag);
        self.run("smembers", conn.smembers(&tag_key)).await
    }

    async fn delete_tag(&self, tag: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let tag_key = self.tag_key(tag);

        let members: Vec<String> = self.run("smembers", conn.smembers(&tag_key)).await?;
        if members.is_empty() {
            let _: u64 = self.run("del", conn.del(&tag_key)).await?;
            return Ok(0);
        }

        let prefixed: Vec<String> = members.iter().map(|k| self.prefixed_key(k)).collect();
        let mut pipeline = pipe();
        pipeline.atomic();
        pipeline.del(&prefixed);
        pipeline.del(&tag_key).ignore();

        let (removed,): (u64,) = self.run("delete_tag", pipeline.query_async(&mut conn)).await?;
        debug!(tag = %tag, members = members.len(), removed, "Deleted tag set from Redis");
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let tag_space = format!("{}{}", self.prefix, TAG_PREFIX);
        let lock_space = format!("{}{}", self.prefix, LOCK_KEY_PREFIX);
        let matched = self.scan_prefixed(&self.prefixed_key(pattern)).await?;
        Ok(matched
            .iter()
            .filter(|key| !key.starts_with(&tag_space) && !key.starts_with(&lock_space))
            .map(|key| self.strip_prefix(key).to_string())
            .collect())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let reply: Option<String> = self
            .run(
                "set_nx",
                cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let mut invocation = self.release_script.key(&key);
        invocation.arg(expected);
        let deleted: i64 = self
            .run("compare_and_delete", invocation.invoke_async(&mut conn))
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let mut invocation = self.extend_script.key(&key);
        invocation.arg(expected).arg(ttl_millis(ttl));
        let updated: i64 = self
            .run("compare_and_expire", invocation.invoke_async(&mut conn))
            .await?;
        Ok(updated == 1)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = self.run("ping", cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        if self.prefix.is_empty() {
            let _: () = self.run("flushdb", cmd("FLUSHDB").query_async(&mut conn)).await?;
            return Ok(());
        }

        let keys = self.scan_prefixed(&format!("{}*", self.prefix)).await?;
        for chunk in keys.chunks(SCAN_BATCH) {
            let _: u64 = self.run("del", conn.del(chunk)).await?;
        }
        debug!(prefix = %self.prefix, count = keys.len(), "Flushed namespaced keys");
        Ok(())
    }
}
