// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`RemoteStore`] for tests and single-instance deployments.
//!
//! Mirrors the Redis semantics the cache relies on: per-key expiry, tag sets,
//! `SET NX` and compare-and-delete. Atomicity of the lock primitives comes from
//! the DashMap entry API holding the shard lock for the whole check-and-act.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::traits::{RemoteStore, StorageError, LOCK_KEY_PREFIX};
use crate::l1::TagIndex;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct InMemoryStore {
    data: DashMap<String, StoredValue>,
    tags: Mutex<TagIndex>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            tags: Mutex::new(TagIndex::default()),
        }
    }

    /// Number of live keys (expired keys that were never read still count
    /// until the next access touches them).
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw value access for tests that need to inspect or corrupt stored bytes.
    pub fn raw_insert(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        self.data.insert(
            key.to_string(),
            StoredValue {
                bytes,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live(now) => Some(entry.get().bytes.clone()),
            Entry::Occupied(entry) => {
                entry.remove();
                None
            }
            Entry::Vacant(_) => None,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Same floor the Redis store applies to `PX`.
fn lease(ttl: Duration) -> Duration {
    ttl.max(Duration::from_millis(1))
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.live_value(key))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), StorageError> {
        self.raw_insert(key, value.to_vec(), ttl);
        if !tags.is_empty() {
            self.tags.lock().add(key, tags.iter());
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String], tags: &[String]) -> Result<u64, StorageError> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, value)) = self.data.remove(key) {
                if value.is_live(now) {
                    removed += 1;
                }
            }
        }
        if !tags.is_empty() {
            let mut index = self.tags.lock();
            for key in keys {
                index.remove(key, tags.iter());
            }
        }
        Ok(removed)
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.tags.lock().members(tag).into_iter().collect())
    }

    async fn delete_tag(&self, tag: &str) -> Result<u64, StorageError> {
        let members = self.tags.lock().take(tag);
        let now = Instant::now();
        let removed = members
            .iter()
            .filter_map(|key| self.data.remove(key))
            .filter(|(_, value)| value.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| StorageError::Backend(format!("Invalid key pattern '{}': {}", pattern, e)))?;
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.value().is_live(now) && !entry.key().starts_with(LOCK_KEY_PREFIX))
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        let fresh = StoredValue {
            bytes: value.as_bytes().to_vec(),
            expires_at: now + lease(ttl),
        };
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Ok(false);
                }
                entry.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(entry)
                if entry.get().is_live(now) && entry.get().bytes == expected.as_bytes() =>
            {
                entry.remove();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut entry)
                if entry.get().is_live(now) && entry.get().bytes == expected.as_bytes() =>
            {
                entry.get_mut().expires_at = now + lease(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.data.clear();
        self.tags.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStore::new();
        store.set("job:1", b"payload", TTL, &[]).await.unwrap();

        assert_eq!(store.get("job:1").await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(store.get("job:2").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_values_are_absent() {
        let store = InMemoryStore::new();
        store.set("short", b"x", Duration::from_secs(5), &[]).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("short").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_from_tag_sets() {
        let store = InMemoryStore::new();
        store.set("a", b"1", TTL, &tags(&["jobs"])).await.unwrap();
        store.set("b", b"2", TTL, &tags(&["jobs"])).await.unwrap();

        let removed = store.delete(&tags(&["a", "missing"]), &tags(&["jobs"])).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.tag_members("jobs").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_tag_removes_members_and_set() {
        let store = InMemoryStore::new();
        store.set("a", b"1", TTL, &tags(&["jobs"])).await.unwrap();
        store.set("b", b"2", TTL, &tags(&["jobs", "hot"])).await.unwrap();
        store.set("c", b"3", TTL, &tags(&["hot"])).await.unwrap();

        assert_eq!(store.delete_tag("jobs").await.unwrap(), 2);
        assert!(store.tag_members("jobs").await.unwrap().is_empty());
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_tag_leaves_members_in_other_tag_sets() {
        let store = InMemoryStore::new();
        store.set("b", b"2", TTL, &tags(&["jobs", "hot"])).await.unwrap();

        assert_eq!(store.delete_tag("jobs").await.unwrap(), 1);

        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.tag_members("hot").await.unwrap(), vec!["b".to_string()]);
        // The stale member is not counted again
        assert_eq!(store.delete_tag("hot").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_lease_floors_to_one_millisecond() {
        let store = InMemoryStore::new();

        assert!(store.set_if_absent("lock:r", "t1", Duration::ZERO).await.unwrap());
        assert!(!store.set_if_absent("lock:r", "t2", TTL).await.unwrap());

        assert!(store.compare_and_expire("lock:r", "t1", Duration::ZERO).await.unwrap());
        assert!(store.get("lock:r").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get("lock:r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_glob_pattern() {
        let store = InMemoryStore::new();
        for key in ["user:1", "user:2", "job:1"] {
            store.set(key, b"x", TTL, &[]).await.unwrap();
        }

        store.set_if_absent("lock:user:1", "token", TTL).await.unwrap();

        let mut keys = store.keys("user:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
        assert_eq!(store.keys("*").await.unwrap().len(), 3);
        assert!(store.keys("[").await.is_err());
    }

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("lock:r", "t1", TTL).await.unwrap());
        assert!(!store.set_if_absent("lock:r", "t2", TTL).await.unwrap());
        assert_eq!(store.get("lock:r").await.unwrap(), Some(b"t1".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_succeeds_after_expiry() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("lock:r", "t1", Duration::from_secs(1)).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_if_absent("lock:r", "t2", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_matching_value() {
        let store = InMemoryStore::new();
        store.set_if_absent("lock:r", "t1", TTL).await.unwrap();

        assert!(!store.compare_and_delete("lock:r", "other").await.unwrap());
        assert!(store.get("lock:r").await.unwrap().is_some());
        assert!(store.compare_and_delete("lock:r", "t1").await.unwrap());
        assert!(store.get("lock:r").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_expire_extends_lease() {
        let store = InMemoryStore::new();
        store.set_if_absent("lock:r", "t1", Duration::from_secs(2)).await.unwrap();

        assert!(!store.compare_and_expire("lock:r", "nope", TTL).await.unwrap());
        assert!(store.compare_and_expire("lock:r", "t1", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get("lock:r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let store = InMemoryStore::new();
        store.set("a", b"1", TTL, &tags(&["t"])).await.unwrap();
        store.flush().await.unwrap();

        assert!(store.is_empty());
        assert!(store.tag_members("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_set_if_absent_single_winner() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set_if_absent("lock:race", &format!("t{}", i), TTL).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
