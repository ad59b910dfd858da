// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invalidation, cache patterns, locks and introspection for TieredCache.
//!
//! Extends the core get/set/delete in `mod.rs` with:
//! - Group invalidation by tag and by key pattern
//! - Cache-aside, write-through and write-behind helpers
//! - Distributed locks sharing the L2 breaker
//! - Stats and health reporting

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{CacheEvent, CacheStats, HealthCheck, L1Health, L2Health, L2Stats, OverallStats, SetOptions};
use super::TieredCache;
use crate::error::CacheError;
use crate::l1::hit_rate;
use crate::lock::{DistributedLock, LockGuard};
use crate::storage::traits::StorageError;

impl TieredCache {
    // --- Invalidation ---

    /// Delete every key tagged `tag`, in both tiers.
    ///
    /// L1 drops its indexed keys synchronously; L2 deletes the tag set's
    /// members and the set itself in one pipeline. Returns the L2 count when
    /// L2 answered, otherwise the L1 count.
    #[tracing::instrument(skip(self))]
    pub async fn delete_by_tag(&self, tag: &str) -> u64 {
        let l1_count = self.l1.delete_by_tag(tag) as u64;

        let mut l2_count = None;
        if let Some(store) = self.l2_store() {
            match self.breaker.call(|| store.delete_tag(tag)).await {
                Ok(count) => {
                    crate::metrics::record_operation("L2", "delete_by_tag", "success");
                    l2_count = Some(count);
                }
                Err(e) => self.record_l2_failure("delete_by_tag", tag, &e),
            }
        }

        let count = l2_count.unwrap_or(l1_count);
        debug!(l1 = l1_count, l2 = ?l2_count, "Invalidated tag");
        crate::metrics::record_invalidation("tag", count);
        self.emit(CacheEvent::Invalidate { tag: tag.to_string(), count });
        count
    }

    /// Delete every L2 key matching a glob pattern (`job:*`, `user:?`, `[ab]*`).
    ///
    /// L1 has no pattern scan; the keys L2 reports are dropped from L1 too.
    /// Without L2 this is a no-op returning 0.
    #[tracing::instrument(skip(self))]
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let Some(store) = self.l2_store() else {
            debug!("No L2, pattern delete skipped");
            return 0;
        };

        let result = self
            .breaker
            .call(|| async {
                let keys = store.keys(pattern).await?;
                let removed = store.delete(&keys, &[]).await?;
                Ok::<_, StorageError>((keys, removed))
            })
            .await;

        match result {
            Ok((keys, removed)) => {
                for key in &keys {
                    self.l1.delete(key);
                }
                crate::metrics::record_operation("L2", "delete_by_pattern", "success");
                crate::metrics::record_invalidation("pattern", removed);
                debug!(matched = keys.len(), removed, "Invalidated pattern");
                self.emit(CacheEvent::Invalidate { tag: pattern.to_string(), count: removed });
                removed
            }
            Err(e) => {
                self.record_l2_failure("delete_by_pattern", pattern, &e);
                0
            }
        }
    }

    /// Flush L1 and this cache's L2 namespace.
    pub async fn clear(&self) {
        self.l1.clear();

        if let Some(store) = self.l2_store() {
            match self.breaker.call(|| store.flush()).await {
                Ok(()) => info!("Cache cleared (L1 + L2)"),
                Err(e) => self.record_l2_failure("clear", "*", &e),
            }
        } else {
            info!("Cache cleared (L1)");
        }
    }

    // --- Cache patterns ---

    /// Cache-aside: return the cached value, or run `factory` and cache what
    /// it produces.
    ///
    /// `factory` runs at most once per call. Concurrent callers missing the
    /// same key each run their own factory; wrap the call in
    /// [`with_lock`](Self::with_lock) when that matters.
    ///
    /// A factory returning `Ok(None)` caches nothing. Factory errors are
    /// returned unchanged.
    pub async fn get_or_set<T, F, Fut, E>(&self, key: &str, factory: F, options: SetOptions) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(Some(cached));
        }

        let produced = factory().await?;
        if let Some(value) = &produced {
            self.set(key, value, options).await;
        }
        Ok(produced)
    }

    /// Write-through: run the authoritative `write_fn` first and cache its
    /// result only if it succeeds, so the cache is never ahead of the source.
    pub async fn write_through<T, R, F, Fut, E>(
        &self,
        key: &str,
        value: T,
        write_fn: F,
        options: SetOptions,
    ) -> Result<R, E>
    where
        R: Serialize,
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let written = write_fn(value).await?;
        self.set(key, &written, options).await;
        Ok(written)
    }

    /// Write-behind: cache `value` now and persist it with `queue_fn` on a
    /// spawned task. The cache may be ahead of the source until it finishes.
    ///
    /// A failed `queue_fn` is logged and counted in
    /// `stats().overall.write_behind_failures`; the cached value stays.
    pub async fn write_behind<T, F, Fut, E>(&self, key: &str, value: T, queue_fn: F, options: SetOptions) -> T
    where
        T: Serialize + Clone,
        F: FnOnce(String, T) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.set(key, &value, options).await;

        let persist = queue_fn(key.to_string(), value.clone());
        let counters = self.counters.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = persist.await {
                counters.write_behind_failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_write_behind_failure();
                warn!(key = %key, error = %e, "Write-behind persistence failed");
            }
        });

        value
    }

    // --- Locks ---

    /// The distributed lock client, sharing this cache's store and breaker.
    #[must_use]
    pub fn locks(&self) -> &DistributedLock {
        &self.lock
    }

    pub async fn acquire_lock(&self, resource: &str, ttl: Duration) -> Option<String> {
        self.lock.acquire(resource, ttl).await
    }

    pub async fn release_lock(&self, resource: &str, token: &str) -> bool {
        self.lock.release(resource, token).await
    }

    pub async fn extend_lock(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        self.lock.extend(resource, token, ttl).await
    }

    /// Acquire with the configured default lease and return a guard.
    pub async fn lock(&self, resource: &str) -> Result<LockGuard, CacheError> {
        self.lock.lock(resource, self.lock.default_ttl()).await
    }

    /// Run `f` under the lock; see [`DistributedLock::with_lock`].
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, ttl: Duration, f: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock.with_lock(resource, ttl, f).await
    }

    // --- Introspection ---

    /// Point-in-time counters for both tiers and the breaker. No I/O.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let l1 = self.l1.stats();
        let c = &self.counters;

        let l2_hits = c.l2_hits.load(Ordering::Relaxed);
        let l2_misses = c.l2_misses.load(Ordering::Relaxed);
        let hits = l1.hits + l2_hits;
        let misses = c.misses.load(Ordering::Relaxed);

        CacheStats {
            l2: L2Stats {
                enabled: self.l2_store().is_some(),
                hits: l2_hits,
                misses: l2_misses,
                errors: c.l2_errors.load(Ordering::Relaxed),
                hit_rate: hit_rate(l2_hits, l2_misses),
            },
            overall: OverallStats {
                hits,
                misses,
                hit_rate: hit_rate(hits, misses),
                sets: c.sets.load(Ordering::Relaxed),
                deletes: c.deletes.load(Ordering::Relaxed),
                write_behind_failures: c.write_behind_failures.load(Ordering::Relaxed),
            },
            l1,
            circuit_breaker: self.breaker.snapshot(),
        }
    }

    /// Report L1 occupancy and ping L2 through the breaker.
    ///
    /// Never touches cached data. An open breaker reports L2 as disconnected
    /// without sending the ping.
    pub async fn health_check(&self) -> HealthCheck {
        let stats = self.l1.stats();
        let l1 = L1Health {
            entries: stats.entries,
            memory_bytes: stats.memory_bytes,
            max_entries: stats.max_entries,
            max_memory_bytes: stats.max_memory_bytes,
        };

        let l2 = match self.l2_store() {
            None => L2Health { enabled: false, connected: None, latency_ms: None, error: None },
            Some(store) => {
                let start = Instant::now();
                match self.breaker.call(|| store.ping()).await {
                    Ok(()) => L2Health {
                        enabled: true,
                        connected: Some(true),
                        latency_ms: Some(start.elapsed().as_millis() as u64),
                        error: None,
                    },
                    Err(e) => L2Health {
                        enabled: true,
                        connected: Some(false),
                        latency_ms: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        };
        if let Some(connected) = l2.connected {
            crate::metrics::set_backend_healthy("redis", connected);
        }

        HealthCheck {
            healthy: l2.connected != Some(false),
            l1,
            l2,
            circuit_breaker: self.breaker.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieredCacheConfig;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::RemoteStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn cache_over() -> (TieredCache, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (TieredCache::with_store(TieredCacheConfig::default(), store.clone()), store)
    }

    #[tokio::test]
    async fn test_delete_by_tag_both_tiers() {
        let (cache, store) = cache_over();
        cache.set("job:1", &1, SetOptions::new().tags(["job"])).await;
        cache.set("job:2", &2, SetOptions::new().tags(["job"])).await;
        cache.set("user:1", &3, SetOptions::new().tags(["user"])).await;

        assert_eq!(cache.delete_by_tag("job").await, 2);

        assert_eq!(cache.get::<i32>("job:1").await, None);
        assert_eq!(cache.get::<i32>("job:2").await, None);
        assert_eq!(cache.get::<i32>("user:1").await, Some(3));
        assert!(store.tag_members("job").await.unwrap().is_empty());
        assert!(cache.l1().keys_for_tag("job").is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_tag_falls_back_to_l1_count() {
        let cache = TieredCache::new(TieredCacheConfig::default());
        cache.set("a", &1, SetOptions::new().tag("t")).await;
        cache.set("b", &2, SetOptions::new().tag("t")).await;

        assert_eq!(cache.delete_by_tag("t").await, 2);
        assert_eq!(cache.delete_by_tag("t").await, 0);
    }

    #[tokio::test]
    async fn test_delete_by_pattern() {
        let (cache, store) = cache_over();
        cache.set("job:1", &1, SetOptions::new()).await;
        cache.set("job:2", &2, SetOptions::new()).await;
        cache.set("user:1", &3, SetOptions::new()).await;

        assert_eq!(cache.delete_by_pattern("job:*").await, 2);

        assert!(!cache.l1().contains_key("job:1"));
        assert!(store.get("job:2").await.unwrap().is_none());
        assert_eq!(cache.get::<i32>("user:1").await, Some(3));
    }

    #[tokio::test]
    async fn test_get_or_set_runs_factory_once() {
        let (cache, _store) = cache_over();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let value = cache
                .get_or_set(
                    "expensive",
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(Some(42))
                    },
                    SetOptions::new(),
                )
                .await
                .unwrap();
            assert_eq!(value, Some(42));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_none_and_error_not_cached() {
        let (cache, _store) = cache_over();

        let none = cache
            .get_or_set::<i32, _, _, String>("k", || async { Ok(None) }, SetOptions::new())
            .await
            .unwrap();
        assert_eq!(none, None);

        let err = cache
            .get_or_set::<i32, _, _, _>("k", || async { Err("source down") }, SetOptions::new())
            .await;
        assert_eq!(err, Err("source down"));
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_write_through_caches_only_on_success() {
        let (cache, _store) = cache_over();

        let saved = cache
            .write_through("job:1", 10, |v| async move { Ok::<_, String>(v * 2) }, SetOptions::new())
            .await
            .unwrap();
        assert_eq!(saved, 20);
        assert_eq!(cache.get::<i32>("job:1").await, Some(20));

        let failed = cache
            .write_through("job:2", 10, |_| async { Err::<i32, _>("constraint violation") }, SetOptions::new())
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get::<i32>("job:2").await, None);
    }

    #[tokio::test]
    async fn test_write_behind_caches_immediately() {
        let (cache, _store) = cache_over();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let value = cache
            .write_behind(
                "job:1",
                "draft".to_string(),
                |key, value| async move {
                    let _ = tx.send((key, value));
                    Ok::<_, String>(())
                },
                SetOptions::new(),
            )
            .await;

        assert_eq!(value, "draft");
        assert_eq!(cache.get::<String>("job:1").await.as_deref(), Some("draft"));
        assert_eq!(rx.await.unwrap(), ("job:1".to_string(), "draft".to_string()));
    }

    #[tokio::test]
    async fn test_write_behind_failure_counted() {
        let (cache, _store) = cache_over();

        cache
            .write_behind("k", 1, |_, _| async { Err::<(), _>("queue full") }, SetOptions::new())
            .await;

        for _ in 0..100 {
            if cache.stats().overall.write_behind_failures == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.stats().overall.write_behind_failures, 1);
        assert_eq!(cache.get::<i32>("k").await, Some(1));
    }

    #[tokio::test]
    async fn test_lock_delegation() {
        let (cache, _store) = cache_over();

        let token = cache.acquire_lock("payout:lock:7", Duration::from_secs(30)).await.unwrap();
        assert!(cache.acquire_lock("payout:lock:7", Duration::from_secs(30)).await.is_none());
        assert!(cache.extend_lock("payout:lock:7", &token, Duration::from_secs(60)).await);
        assert!(!cache.release_lock("payout:lock:7", "wrong-token").await);
        assert!(cache.release_lock("payout:lock:7", &token).await);

        let guard = cache.lock("payout:lock:7").await.unwrap();
        assert!(cache.with_lock("payout:lock:7", Duration::from_secs(5), || async {}).await.is_err());
        assert!(guard.release().await);

        let doubled = cache.with_lock("payout:lock:7", Duration::from_secs(5), || async { 21 * 2 }).await;
        assert_eq!(doubled.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_stats() {
        let (cache, _store) = cache_over();
        cache.set("a", &1, SetOptions::new()).await;
        let _ = cache.get::<i32>("a").await;
        let _ = cache.get::<i32>("missing").await;
        cache.delete("a").await;

        let stats = cache.stats();
        assert_eq!(stats.l1.hits, 1);
        assert_eq!(stats.l2.misses, 1);
        assert_eq!(stats.overall.hits, 1);
        assert_eq!(stats.overall.misses, 1);
        assert_eq!(stats.overall.sets, 1);
        assert_eq!(stats.overall.deletes, 1);
        assert!((stats.overall.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.circuit_breaker.name, "l2");
    }

    #[tokio::test]
    async fn test_health_check() {
        let (cache, store) = cache_over();
        cache.set("a", &1, SetOptions::new()).await;

        let health = cache.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.l1.entries, 1);
        assert_eq!(health.l2.connected, Some(true));
        assert!(health.l2.latency_ms.is_some());
        assert_eq!(store.len(), 1);

        cache.circuit_breaker().trip();
        let health = cache.health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.l2.connected, Some(false));
    }

    #[tokio::test]
    async fn test_health_check_l1_only() {
        let cache = TieredCache::new(TieredCacheConfig::default());
        let health = cache.health_check().await;

        assert!(health.healthy);
        assert!(!health.l2.enabled);
        assert_eq!(health.l2.connected, None);
    }

    #[tokio::test]
    async fn test_clear() {
        let (cache, store) = cache_over();
        cache.set("a", &1, SetOptions::new().tag("t")).await;
        cache.set("b", &2, SetOptions::new()).await;

        cache.clear().await;

        assert!(cache.l1().is_empty());
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.tag_members("t").await.unwrap().is_empty());
    }
}
