// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Keyspace holding distributed lock tokens. Never returned by [`RemoteStore::keys`].
pub const LOCK_KEY_PREFIX: &str = "lock:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Malformed data for '{key}': {reason}")]
    Serialization { key: String, reason: String },
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// The shared key-value store behind the L2 tier and the distributed lock.
///
/// Keys passed in are unprefixed; implementations that namespace keys apply
/// their prefix internally and strip it from anything they return.
///
/// Tag sets live next to the data keys (`tag:<name>` in Redis) and hold the
/// data keys tagged with that name.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` with an expiry and add `key` to every tag set in `tags`.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), StorageError>;

    /// Delete `keys` and remove them from the given tag sets.
    /// Returns how many keys actually existed.
    async fn delete(&self, keys: &[String], tags: &[String]) -> Result<u64, StorageError>;

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, StorageError>;

    /// Delete every key in the tag set along with the set itself.
    /// Returns how many member keys were removed.
    async fn delete_tag(&self, tag: &str) -> Result<u64, StorageError>;

    /// List data keys matching a glob-style pattern. Tag sets and lock keys
    /// are not data keys.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    /// Atomic `SET key value NX EX ttl`. Returns whether the key was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Atomically delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError>;

    /// Atomically reset the expiry of `key` only if its current value equals `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    /// Remove everything this store owns (its namespace, or the whole database
    /// when it has none).
    async fn flush(&self) -> Result<(), StorageError>;
}
