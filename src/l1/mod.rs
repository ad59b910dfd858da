// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L1: bounded in-process cache.
//!
//! One mutex guards the entry map, the tag index and the memory counter
//! together, so "key is indexed under T iff its entry carries T" holds after
//! every operation. Nothing in here awaits while holding it.
//!
//! Capacity is dual-bounded (entry count and serialized bytes). Whichever
//! bound is hit first evicts the least-recently-accessed entry, repeatedly,
//! until the incoming entry fits.

mod entry;
mod tag_index;

pub use entry::CacheEntry;
pub use tag_index::TagIndex;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::L1Config;

#[derive(Debug, Default)]
struct L1State {
    entries: HashMap<String, CacheEntry>,
    tags: TagIndex,
    memory_bytes: usize,
    clock: u64,
}

impl L1State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.tags.remove(key, entry.tags.iter());
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn least_recently_used(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.access_seq)
            .map(|(key, _)| key.clone())
    }
}

/// Point-in-time L1 counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct L1Stats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub tags: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

pub struct L1Cache {
    state: Mutex<L1State>,
    max_entries: usize,
    max_memory_bytes: usize,
    max_ttl: Duration,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl L1Cache {
    #[must_use]
    pub fn new(config: &L1Config) -> Self {
        Self {
            state: Mutex::new(L1State::default()),
            max_entries: config.max_entries.max(1),
            max_memory_bytes: config.max_memory_mb.saturating_mul(1024 * 1024),
            max_ttl: Duration::from_secs(config.ttl_secs),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Byte-budget constructor for callers that size L1 below a megabyte (tests, mostly).
    #[must_use]
    pub fn with_limits(max_entries: usize, max_memory_bytes: usize, max_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(L1State::default()),
            max_entries: max_entries.max(1),
            max_memory_bytes,
            max_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Longest lifetime an L1 entry may have; longer TTLs are capped to it.
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// Look up a live entry, bumping its access bookkeeping.
    /// Expired entries are removed on read and reported absent.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            drop(state);
            crate::metrics::record_expired(1);
            self.publish_gauges();
            return None;
        }

        let seq = state.tick();
        let entry = state.entries.get_mut(key)?;
        entry.record_access(now, seq);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Live-entry check that does not count as an access.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Insert or replace `key`.
    ///
    /// `size_bytes` is the serialized size of `value`. The TTL is capped at
    /// [`max_ttl`](Self::max_ttl); a zero TTL (or an entry larger than the
    /// whole memory budget) removes any existing entry and stores nothing.
    pub fn set<I, S>(
        &self,
        key: &str,
        value: serde_json::Value,
        size_bytes: usize,
        ttl: Duration,
        tags: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ttl = ttl.min(self.max_ttl);
        let now = Instant::now();
        let mut state = self.state.lock();

        state.remove(key);

        if ttl.is_zero() || size_bytes > self.max_memory_bytes {
            debug!(key = %key, size_bytes, ?ttl, "Entry not cacheable in L1");
            drop(state);
            self.publish_gauges();
            return;
        }

        let mut evicted = 0usize;
        let mut evicted_bytes = 0usize;
        while state.entries.len() >= self.max_entries
            || state.memory_bytes + size_bytes > self.max_memory_bytes
        {
            let Some(victim) = state.least_recently_used() else { break };
            if let Some(entry) = state.remove(&victim) {
                evicted += 1;
                evicted_bytes += entry.size_bytes;
                debug!(key = %victim, "Evicted from L1 (LRU)");
            }
        }

        let tags: HashSet<String> = tags.into_iter().map(Into::into).collect();
        state.tags.add(key, tags.iter());
        let seq = state.tick();
        state.memory_bytes += size_bytes;
        state
            .entries
            .insert(key.to_string(), CacheEntry::new(value, size_bytes, ttl, tags, now, seq));
        drop(state);

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_eviction(evicted, evicted_bytes);
        }
        self.publish_gauges();
    }

    /// Remove `key` and its tag memberships. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            self.publish_gauges();
        }
        removed
    }

    /// Remove every key indexed under `tag`, then the tag itself.
    pub fn delete_by_tag(&self, tag: &str) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let keys = state.tags.take(tag);
            keys.iter().filter(|key| state.remove(key).is_some()).count()
        };
        if removed > 0 {
            self.publish_gauges();
        }
        removed
    }

    pub fn clear(&self) {
        *self.state.lock() = L1State::default();
        self.publish_gauges();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.remove(key);
            }
            expired.len()
        };

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            crate::metrics::record_expired(removed);
            self.publish_gauges();
        }
        removed
    }

    /// Start the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped. Returns `None` outside a runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));

        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let removed = cache.purge_expired();
                if removed > 0 {
                    info!(removed, "L1 sweep removed expired entries");
                }
            }
        }))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.state.lock().memory_bytes
    }

    /// Tags carried by a stored entry (expired or not).
    #[must_use]
    pub fn tags_of(&self, key: &str) -> Option<HashSet<String>> {
        self.state.lock().entries.get(key).map(|entry| entry.tags.clone())
    }

    /// Keys the tag index currently lists under `tag`.
    #[must_use]
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        self.state.lock().tags.members(tag)
    }

    /// Whether the entries and the tag index agree in both directions, and
    /// the memory counter equals the sum of entry sizes.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();
        let forward = state
            .entries
            .iter()
            .all(|(key, entry)| entry.tags.iter().all(|tag| state.tags.contains(tag, key)));
        let backward = state.tags.iter().all(|(tag, keys)| {
            !keys.is_empty()
                && keys
                    .iter()
                    .all(|key| state.entries.get(key).is_some_and(|e| e.tags.contains(tag)))
        });
        let bytes: usize = state.entries.values().map(|e| e.size_bytes).sum();
        forward && backward && bytes == state.memory_bytes
    }

    #[must_use]
    pub fn stats(&self) -> L1Stats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let state = self.state.lock();
        L1Stats {
            entries: state.entries.len(),
            memory_bytes: state.memory_bytes,
            max_entries: self.max_entries,
            max_memory_bytes: self.max_memory_bytes,
            tags: state.tags.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
        }
    }

    fn publish_gauges(&self) {
        let (items, bytes) = {
            let state = self.state.lock();
            (state.entries.len(), state.memory_bytes)
        };
        crate::metrics::set_l1_cache_items(items);
        crate::metrics::set_l1_cache_bytes(bytes);
    }
}

/// `hits / (hits + misses)`, zero before the first lookup.
#[must_use]
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn small(max_entries: usize) -> L1Cache {
        L1Cache::with_limits(max_entries, 1024 * 1024, Duration::from_secs(300))
    }

    fn put(cache: &L1Cache, key: &str, tags: &[&str]) {
        cache.set(key, json!(key), 8, TTL, tags.iter().copied());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = small(10);
        put(&cache, "job:42", &["job"]);

        assert_eq!(cache.get("job:42"), Some(json!("job:42")));
        assert_eq!(cache.get("job:43"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let cache = small(10);
        cache.set("k", json!(1), 1, Duration::from_secs(5), std::iter::empty::<String>());

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_capped_to_max() {
        let cache = L1Cache::with_limits(10, 1024, Duration::from_secs(10));
        cache.set("k", json!(1), 1, Duration::from_secs(3600), std::iter::empty::<String>());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_removes_existing() {
        let cache = small(10);
        put(&cache, "k", &["t"]);
        cache.set("k", json!(2), 1, Duration::ZERO, ["t"]);

        assert!(cache.get("k").is_none());
        assert!(cache.keys_for_tag("t").is_empty());
        assert!(cache.is_consistent());
    }

    #[tokio::test]
    async fn test_lru_evicts_first_inserted() {
        let cache = small(3);
        for key in ["a", "b", "c", "d"] {
            put(&cache, key, &[]);
        }

        assert!(!cache.contains_key("a"));
        assert!(cache.contains_key("b"));
        assert!(cache.contains_key("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_lru_read_protects_entry() {
        let cache = small(3);
        for key in ["a", "b", "c"] {
            put(&cache, key, &[]);
        }
        assert!(cache.get("a").is_some());

        put(&cache, "d", &[]);

        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
    }

    #[tokio::test]
    async fn test_replacing_key_does_not_evict_others() {
        let cache = small(2);
        put(&cache, "a", &[]);
        put(&cache, "b", &[]);
        cache.set("a", json!("new"), 8, TTL, std::iter::empty::<String>());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(json!("new")));
        assert!(cache.contains_key("b"));
    }

    #[tokio::test]
    async fn test_memory_budget_evicts() {
        let cache = L1Cache::with_limits(100, 100, TTL);
        cache.set("a", json!("a"), 40, TTL, std::iter::empty::<String>());
        cache.set("b", json!("b"), 40, TTL, std::iter::empty::<String>());
        cache.set("c", json!("c"), 40, TTL, std::iter::empty::<String>());

        assert!(!cache.contains_key("a"));
        assert_eq!(cache.memory_bytes(), 80);
        assert!(cache.is_consistent());
    }

    #[tokio::test]
    async fn test_oversized_entry_not_stored() {
        let cache = L1Cache::with_limits(100, 100, TTL);
        cache.set("a", json!("a"), 40, TTL, std::iter::empty::<String>());
        cache.set("huge", json!("h"), 101, TTL, std::iter::empty::<String>());

        assert!(!cache.contains_key("huge"));
        assert!(cache.contains_key("a"));
    }

    #[tokio::test]
    async fn test_memory_accounting_on_replace_and_delete() {
        let cache = small(10);
        cache.set("a", json!("a"), 10, TTL, std::iter::empty::<String>());
        cache.set("a", json!("aa"), 25, TTL, std::iter::empty::<String>());
        assert_eq!(cache.memory_bytes(), 25);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_from_all_tags() {
        let cache = small(10);
        put(&cache, "job:1", &["job", "job:1"]);
        put(&cache, "job:2", &["job"]);

        cache.delete("job:1");

        assert!(cache.keys_for_tag("job:1").is_empty());
        assert_eq!(cache.keys_for_tag("job").len(), 1);
        assert!(cache.is_consistent());
    }

    #[tokio::test]
    async fn test_delete_by_tag() {
        let cache = small(10);
        put(&cache, "job:1", &["job", "hot"]);
        put(&cache, "job:2", &["job"]);
        put(&cache, "user:1", &["hot"]);

        assert_eq!(cache.delete_by_tag("job"), 2);
        assert_eq!(cache.delete_by_tag("job"), 0);

        assert!(!cache.contains_key("job:1"));
        assert!(cache.contains_key("user:1"));
        assert_eq!(cache.keys_for_tag("hot").len(), 1);
        assert!(cache.is_consistent());
    }

    #[tokio::test]
    async fn test_retagging_on_replace() {
        let cache = small(10);
        put(&cache, "k", &["old"]);
        put(&cache, "k", &["new"]);

        assert!(cache.keys_for_tag("old").is_empty());
        assert_eq!(cache.tags_of("k").unwrap().len(), 1);
        assert!(cache.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = small(10);
        cache.set("short", json!(1), 4, Duration::from_secs(1), ["t"]);
        cache.set("long", json!(2), 4, Duration::from_secs(100), ["t"]);

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_bytes(), 4);
        assert_eq!(cache.keys_for_tag("t").len(), 1);
        assert!(cache.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically_and_stops_on_drop() {
        let cache = Arc::new(small(10));
        cache.set("k", json!(1), 1, Duration::from_secs(1), std::iter::empty::<String>());
        let handle = cache.spawn_sweeper(Duration::from_secs(5)).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = small(10);
        put(&cache, "a", &["t"]);
        put(&cache, "b", &["t"]);

        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.memory_bytes(), 0);
        assert!(cache.keys_for_tag("t").is_empty());
    }
}
