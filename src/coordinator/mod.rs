// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tiered cache coordinator.
//!
//! The [`TieredCache`] is the main orchestrator that ties together:
//! - L1: In-process LRU cache with TTLs and a tag index
//! - L2: Shared store (Redis) behind a circuit breaker
//! - Distributed locks on the same store
//!
//! Reads check L1 first and fall back to L2, promoting hits into L1. Writes go
//! to both tiers. An unhealthy L2 never fails a read or a write: the breaker
//! isolates it, the call degrades to a miss or an L1-only write, and the
//! failure is logged and counted.

mod api;
mod codec;
mod types;

pub use types::{
    CacheEvent, CacheStats, HealthCheck, L1Health, L2Health, L2Stats, OverallStats, SetOptions, Tier,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TieredCacheConfig;
use crate::error::CacheError;
use crate::l1::L1Cache;
use crate::lock::DistributedLock;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::storage::redis::RedisStore;
use crate::storage::traits::{RemoteStore, StorageError};

const L2_CIRCUIT: &str = "l2";

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub l2_hits: AtomicU64,
    pub l2_misses: AtomicU64,
    pub l2_errors: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub write_behind_failures: AtomicU64,
}

/// Two-tier cache: in-process L1 in front of a shared L2.
///
/// Construct it explicitly and share it as `Arc<TieredCache>`; independently
/// configured instances can coexist in one process.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use tiered_cache::{InMemoryStore, SetOptions, TieredCache, TieredCacheConfig};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = TieredCache::with_store(TieredCacheConfig::default(), Arc::new(InMemoryStore::new()));
///
/// cache.set("job:42", &"Engineer", SetOptions::new().ttl_secs(300).tags(["job", "job:42"])).await;
/// assert_eq!(cache.get::<String>("job:42").await.as_deref(), Some("Engineer"));
///
/// assert_eq!(cache.delete_by_tag("job").await, 1);
/// assert_eq!(cache.get::<String>("job:42").await, None);
/// # }
/// ```
pub struct TieredCache {
    config: TieredCacheConfig,
    l1: Arc<L1Cache>,
    l2: Option<Arc<dyn RemoteStore>>,
    breaker: Arc<CircuitBreaker>,
    lock: DistributedLock,
    events: broadcast::Sender<CacheEvent>,
    counters: Arc<Counters>,
    sweeper: Option<JoinHandle<()>>,
}

impl TieredCache {
    /// L1-only cache. Locks fail closed (there is nothing to lock against).
    pub fn new(config: TieredCacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Cache over an explicit shared store.
    ///
    /// With `l2.enabled = false` the store is still used for locks, just not
    /// for cached values.
    pub fn with_store(config: TieredCacheConfig, store: Arc<dyn RemoteStore>) -> Self {
        Self::build(config, Some(store))
    }

    /// Connect to Redis at `l2.redis_url` (when L2 is enabled) and build the cache.
    ///
    /// Connection is retried briefly at startup; after that a down Redis only
    /// degrades the cache, it never fails it.
    pub async fn connect(config: TieredCacheConfig) -> Result<Self, CacheError> {
        let url = match (&config.l2.redis_url, config.l2.enabled) {
            (Some(url), true) => url.clone(),
            (None, true) => {
                info!("L2 enabled without a redis_url, running L1-only");
                return Ok(Self::new(config));
            }
            (_, false) => return Ok(Self::new(config)),
        };

        let store = RedisStore::with_prefix(&url, config.l2.prefix.as_deref()).await?;
        info!(prefix = ?config.l2.prefix, "Connected to Redis L2");
        Ok(Self::with_store(config, Arc::new(store)))
    }

    fn build(config: TieredCacheConfig, store: Option<Arc<dyn RemoteStore>>) -> Self {
        let l1 = Arc::new(L1Cache::new(&config.l1));
        let breaker = Arc::new(CircuitBreaker::new(
            L2_CIRCUIT,
            CircuitConfig::from(&config.circuit_breaker),
        ));
        let lock = DistributedLock::new(store.clone(), breaker.clone(), config.lock.ttl());
        let (events, _) = broadcast::channel(config.events.capacity.max(1));

        // Only possible inside a runtime; without one, expiry is on read or purge_expired()
        let sweeper = l1.spawn_sweeper(config.l1.check_interval());
        if sweeper.is_none() {
            debug!("No tokio runtime, L1 sweeper not started");
        }

        Self {
            config,
            l1,
            l2: store,
            breaker,
            lock,
            events,
            counters: Arc::new(Counters::default()),
            sweeper,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TieredCacheConfig {
        &self.config
    }

    /// The in-process tier.
    #[must_use]
    pub fn l1(&self) -> &L1Cache {
        &self.l1
    }

    /// The breaker guarding every L2 and lock call.
    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Store used for cached values, if L2 is configured and enabled.
    fn l2_store(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.l2.as_ref().filter(|_| self.config.l2.enabled)
    }

    /// Receive hit/miss/set/delete/invalidate events.
    ///
    /// Publishing never blocks; a subscriber that falls more than
    /// `events.capacity` behind gets `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(event);
        }
    }

    /// Count, log and classify a failed L2 call.
    pub(crate) fn record_l2_failure(&self, operation: &'static str, key: &str, err: &CircuitError<StorageError>) {
        self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
        match err {
            CircuitError::Rejected => {
                debug!(key = %key, operation, "L2 skipped, circuit open");
                crate::metrics::record_operation("L2", operation, "rejected");
            }
            CircuitError::Inner(e) => {
                warn!(key = %key, operation, error = %e, "L2 call failed");
                crate::metrics::record_operation("L2", operation, "error");
                crate::metrics::record_error("L2", operation, "backend");
            }
        }
    }

    /// Resolve the TTL for a write: explicit, then category, then default.
    fn resolve_ttl(&self, options: &SetOptions) -> Duration {
        options
            .ttl
            .unwrap_or_else(|| self.config.l2.ttl_for(options.category.as_deref()))
    }

    // --- Core operations ---

    /// Get a value by key.
    ///
    /// Checks L1, then L2. An L2 hit is promoted into L1 with its tags, for
    /// the default TTL capped at L1's own maximum. L2 errors, an open
    /// breaker, undecodable bytes and values of the wrong type all read as a
    /// miss.
    #[tracing::instrument(skip(self), fields(tier))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let start = Instant::now();

        if let Some(value) = self.l1.get(key) {
            match serde_json::from_value(value) {
                Ok(decoded) => {
                    tracing::Span::current().record("tier", "L1");
                    debug!("L1 hit");
                    crate::metrics::record_operation("L1", "get", "hit");
                    crate::metrics::record_latency("L1", "get", start.elapsed());
                    self.emit(CacheEvent::Hit { key: key.to_string(), tier: Tier::L1 });
                    return Some(decoded);
                }
                Err(e) => {
                    warn!(error = %e, "L1 value does not match the requested type");
                    crate::metrics::record_error("L1", "get", "serialization");
                    return self.miss(key);
                }
            }
        }
        crate::metrics::record_operation("L1", "get", "miss");

        let Some(store) = self.l2_store() else {
            return self.miss(key);
        };

        let l2_start = Instant::now();
        let fetched = self.breaker.call(|| store.get(key)).await;
        crate::metrics::record_latency("L2", "get", l2_start.elapsed());

        let bytes = match fetched {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_operation("L2", "get", "miss");
                debug!("L2 miss");
                return self.miss(key);
            }
            Err(e) => {
                self.record_l2_failure("get", key, &e);
                return self.miss(key);
            }
        };
        crate::metrics::record_bytes_read("L2", bytes.len());

        let envelope = match codec::decode(key, &bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Undecodable L2 value, treating as miss");
                crate::metrics::record_error("L2", "get", "serialization");
                return self.miss(key);
            }
        };

        let decoded: T = match serde_json::from_value(envelope.v.clone()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "L2 value does not match the requested type");
                crate::metrics::record_error("L2", "get", "serialization");
                return self.miss(key);
            }
        };

        let size = codec::json_size(&envelope.v);
        self.l1.set(key, envelope.v, size, self.config.l2.ttl_for(None), envelope.tags);

        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("tier", "L2");
        debug!("L2 hit, promoted to L1");
        crate::metrics::record_operation("L2", "get", "hit");
        self.emit(CacheEvent::Hit { key: key.to_string(), tier: Tier::L2 });
        Some(decoded)
    }

    fn miss<T>(&self, key: &str) -> Option<T> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("tier", "miss");
        self.emit(CacheEvent::Miss { key: key.to_string() });
        None
    }

    /// Store a value in L1 and (unless disabled) L2.
    ///
    /// L1 keeps it for at most `l1.ttl_secs`; L2 keeps it for the full TTL.
    /// Tags are indexed in every tier written, and a tier left out by
    /// `to_l1`/`to_l2` drops its copy of the key. A zero TTL deletes the key.
    /// Failures are logged, never returned: an L2 outage leaves the L1 write
    /// in place.
    #[tracing::instrument(skip(self, value, options), fields(tags = options.tags.len()))]
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Value not serializable, not cached");
                crate::metrics::record_error("L1", "set", "serialization");
                return;
            }
        };

        let ttl = self.resolve_ttl(&options);
        if ttl.is_zero() {
            debug!("Zero TTL, deleting instead");
            self.delete(key).await;
            return;
        }

        // A tier that isn't written must not keep serving the previous value
        if options.to_l1 {
            let size = codec::json_size(&json);
            self.l1.set(key, json.clone(), size, ttl, options.tags.iter().cloned());
            crate::metrics::record_operation("L1", "set", "success");
        } else {
            self.l1.delete(key);
        }

        if options.to_l2 {
            self.write_l2(key, &json, ttl, &options.tags).await;
        } else {
            self.delete_l2(key).await;
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.emit(CacheEvent::Set { key: key.to_string() });
    }

    async fn write_l2(&self, key: &str, json: &serde_json::Value, ttl: Duration, tags: &[String]) {
        let Some(store) = self.l2_store() else { return };

        let bytes = match codec::encode(json, tags) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode L2 envelope");
                crate::metrics::record_error("L2", "set", "serialization");
                return;
            }
        };

        let start = Instant::now();
        match self.breaker.call(|| store.set(key, &bytes, ttl, tags)).await {
            Ok(()) => {
                crate::metrics::record_operation("L2", "set", "success");
                crate::metrics::record_latency("L2", "set", start.elapsed());
                crate::metrics::record_bytes_written("L2", bytes.len());
            }
            Err(e) => self.record_l2_failure("set", key, &e),
        }
    }

    /// Delete from L1 and L2. Returns whether either tier held the key.
    ///
    /// The L2 delete reads the stored envelope first so the key also leaves
    /// every L2 tag set it was added to.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> bool {
        let in_l1 = self.l1.delete(key);
        if in_l1 {
            debug!("Deleted from L1");
        }

        let in_l2 = self.delete_l2(key).await;

        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.emit(CacheEvent::Delete { key: key.to_string() });
        in_l1 || in_l2
    }

    /// Delete `key` from L2 and from the tag sets its envelope lists.
    /// Returns whether L2 held it.
    async fn delete_l2(&self, key: &str) -> bool {
        let Some(store) = self.l2_store() else { return false };

        let _timer = crate::metrics::LatencyTimer::new("L2", "delete");
        let removed = self
            .breaker
            .call(|| async {
                let tags = match store.get(key).await? {
                    Some(bytes) => codec::decode(key, &bytes).map(|e| e.tags).unwrap_or_default(),
                    None => Vec::new(),
                };
                store.delete(&[key.to_string()], &tags).await
            })
            .await;

        match removed {
            Ok(count) => {
                crate::metrics::record_operation("L2", "delete", "success");
                debug!(key = %key, removed = count, "Deleted from L2");
                count > 0
            }
            Err(e) => {
                self.record_l2_failure("delete", key, &e);
                false
            }
        }
    }

    /// Run the L1 expiry sweep now. The background sweeper calls the same
    /// routine every `l1.check_interval_ms`.
    pub fn purge_expired(&self) -> usize {
        self.l1.purge_expired()
    }
}

impl Drop for TieredCache {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
