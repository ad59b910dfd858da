// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the tiered cache.
//!
//! # Example
//!
//! ```
//! use tiered_cache::TieredCacheConfig;
//!
//! // Minimal config (uses defaults)
//! let config = TieredCacheConfig::default();
//! assert_eq!(config.l1.max_entries, 10_000);
//! assert_eq!(config.l2.ttl_for(None).as_secs(), 3600);
//!
//! // Deserialized from JSON, unspecified fields keep their defaults
//! let config: TieredCacheConfig = serde_json::from_str(r#"{
//!     "l1": { "max_entries": 500 },
//!     "l2": { "redis_url": "redis://localhost:6379", "ttl_secs": { "default": 600, "job": 1800 } },
//!     "key_prefix": { "job": "job:" }
//! }"#).unwrap();
//! assert_eq!(config.l1.ttl_secs, 300);
//! assert_eq!(config.l2.ttl_for(Some("job")).as_secs(), 1800);
//! assert_eq!(config.key("job", "42"), "job:42");
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::resilience::circuit_breaker::CircuitConfig;

/// Configuration for the tiered cache.
///
/// All fields have sensible defaults. For a shared L2, set `l2.redis_url`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TieredCacheConfig {
    #[serde(default)]
    pub l1: L1Config,

    #[serde(default)]
    pub l2: L2Config,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub lock: LockConfig,

    /// Category → key prefix. Callers build keys with [`key`](Self::key);
    /// nothing in the cache checks that they did.
    #[serde(default)]
    pub key_prefix: HashMap<String, String>,

    #[serde(default)]
    pub events: EventsConfig,
}

impl TieredCacheConfig {
    /// Join the configured prefix for `category` with `id`.
    /// Unknown categories fall back to `"{category}:"`.
    #[must_use]
    pub fn key(&self, category: &str, id: &str) -> String {
        match self.key_prefix.get(category) {
            Some(prefix) => format!("{}{}", prefix, id),
            None => format!("{}:{}", category, id),
        }
    }
}

/// In-process tier bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct L1Config {
    #[serde(default = "default_l1_max_entries")]
    pub max_entries: usize,

    /// Aggregate serialized size budget (default: 100 MB)
    #[serde(default = "default_l1_max_memory_mb")]
    pub max_memory_mb: usize,

    /// Upper bound on any L1 entry's lifetime
    #[serde(default = "default_l1_ttl_secs")]
    pub ttl_secs: u64,

    /// Expiry sweep period
    #[serde(default = "default_l1_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_l1_max_entries() -> usize { 10_000 }
fn default_l1_max_memory_mb() -> usize { 100 }
fn default_l1_ttl_secs() -> u64 { 300 }
fn default_l1_check_interval_ms() -> u64 { 60_000 }

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: default_l1_max_entries(),
            max_memory_mb: default_l1_max_memory_mb(),
            ttl_secs: default_l1_ttl_secs(),
            check_interval_ms: default_l1_check_interval_ms(),
        }
    }
}

impl L1Config {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Shared tier settings.
#[derive(Debug, Clone, Deserialize)]
pub struct L2Config {
    #[serde(default = "default_l2_enabled")]
    pub enabled: bool,

    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every Redis key (e.g., "myapp:")
    #[serde(default)]
    pub prefix: Option<String>,

    /// Category → TTL in seconds. `"default"` applies when no category matches.
    #[serde(default = "default_l2_ttl_secs")]
    pub ttl_secs: HashMap<String, u64>,
}

fn default_l2_enabled() -> bool { true }
fn default_l2_ttl_secs() -> HashMap<String, u64> {
    HashMap::from([(DEFAULT_CATEGORY.to_string(), DEFAULT_L2_TTL_SECS)])
}

const DEFAULT_CATEGORY: &str = "default";
const DEFAULT_L2_TTL_SECS: u64 = 3600;

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: default_l2_enabled(),
            redis_url: None,
            prefix: None,
            ttl_secs: default_l2_ttl_secs(),
        }
    }
}

impl L2Config {
    /// TTL for a category: its own entry, then `"default"`, then one hour.
    #[must_use]
    pub fn ttl_for(&self, category: Option<&str>) -> Duration {
        let secs = category
            .and_then(|c| self.ttl_secs.get(c))
            .or_else(|| self.ttl_secs.get(DEFAULT_CATEGORY))
            .copied()
            .unwrap_or(DEFAULT_L2_TTL_SECS);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_reset_timeout_ms() -> u64 { 30_000 }
fn default_half_open_max_calls() -> u32 { 3 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl From<&BreakerConfig> for CircuitConfig {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            half_open_max_calls: config.half_open_max_calls,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Default lease for locks taken without an explicit TTL
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_lock_ttl_secs() -> u64 { 30 }

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_secs: default_lock_ttl_secs() }
    }
}

impl LockConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer; slow subscribers past this many events see `Lagged`
    #[serde(default = "default_events_capacity")]
    pub capacity: usize,
}

fn default_events_capacity() -> usize { 1024 }

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: default_events_capacity() }
    }
}
