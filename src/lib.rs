// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Tiered Cache
//!
//! A two-tier cache: a bounded in-process L1 in front of a shared Redis L2,
//! with tag invalidation, a circuit breaker around every L2 call, and
//! distributed locks on the same store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TieredCache                           │
//! │  • get / set / delete / delete_by_tag / delete_by_pattern  │
//! │  • get_or_set, write_through, write_behind                 │
//! │  • stats, health_check, broadcast events                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    L1: In-Process Cache                     │
//! │  • LRU eviction, dual entry-count / memory budget          │
//! │  • Per-entry TTL, delete-on-read + periodic sweep          │
//! │  • Tag → keys index for group invalidation                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (misses, writes, invalidation)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Circuit Breaker (closed/open/half-open)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     L2: Redis (shared)                      │
//! │  • Values as {"v", "tags"} envelopes with PX expiry        │
//! │  • tag:<name> sets, SCAN for pattern deletes               │
//! │  • lock:<resource> fencing tokens (SET NX, Lua release)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tiered_cache::{SetOptions, TieredCache, TieredCacheConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tiered_cache::CacheError> {
//!     let mut config = TieredCacheConfig::default();
//!     config.l2.redis_url = Some("redis://localhost:6379".into());
//!
//!     let cache = TieredCache::connect(config).await?;
//!
//!     cache.set("job:42", &"Engineer", SetOptions::new().ttl_secs(300).tags(["job", "job:42"])).await;
//!     let title: Option<String> = cache.get("job:42").await;
//!     println!("{:?}", title);
//!
//!     // Invalidate the whole group in both tiers
//!     cache.delete_by_tag("job").await;
//!
//!     // Cross-instance mutual exclusion
//!     cache.with_lock("payout:7", Duration::from_secs(30), || async {
//!         // ... pay out exactly once ...
//!     }).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Failure model
//!
//! The cache is an optimization: a read that fails in L2 is a miss, and a
//! write that fails in L2 still lands in L1. Failures are logged with
//! `tracing`, counted via `metrics`, and fed to the breaker, which stops
//! calling Redis for `reset_timeout_ms` once `failure_threshold` calls in a
//! row have failed. Only lock acquisition reports failure to the caller, as
//! [`CacheError::LockUnavailable`].
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`TieredCache`] orchestrating both tiers
//! - [`l1`]: In-process LRU/TTL/tag cache
//! - [`storage`]: L2 backends (Redis, in-memory)
//! - [`lock`]: Distributed lock over the L2 store
//! - [`resilience`]: Circuit breaker, connection retry
//! - [`config`]: Serde configuration tree

pub mod config;
pub mod coordinator;
pub mod error;
pub mod l1;
pub mod lock;
pub mod metrics;
pub mod resilience;
pub mod storage;

pub use config::{BreakerConfig, EventsConfig, L1Config, L2Config, LockConfig, TieredCacheConfig};
pub use coordinator::{
    CacheEvent, CacheStats, HealthCheck, L1Health, L2Health, L2Stats, OverallStats, SetOptions, Tier, TieredCache,
};
pub use error::CacheError;
pub use l1::{CacheEntry, L1Cache, L1Stats, TagIndex};
pub use lock::{DistributedLock, LockGuard};
pub use metrics::LatencyTimer;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use resilience::retry::RetryConfig;
pub use storage::memory::InMemoryStore;
pub use storage::redis::RedisStore;
pub use storage::traits::{RemoteStore, StorageError};
