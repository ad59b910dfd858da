// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the tiered cache coordinator.

use std::time::Duration;

use serde::Serialize;

use crate::l1::L1Stats;
use crate::resilience::circuit_breaker::{CircuitSnapshot, CircuitState};

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tier {
    /// In-process cache
    L1,
    /// Shared store (Redis)
    L2,
}

impl Tier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options controlling how [`super::TieredCache::set`] stores a value.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tiered_cache::SetOptions;
///
/// let options = SetOptions::new()
///     .ttl(Duration::from_secs(300))
///     .tags(["job", "job:42"]);
/// assert!(options.to_l1 && options.to_l2);
///
/// // Process-local scratch value, never sent to Redis
/// let local = SetOptions::l1_only();
/// assert!(!local.to_l2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOptions {
    /// Explicit lifetime. When unset, the category's configured TTL applies.
    pub ttl: Option<Duration>,
    /// Key category for TTL lookup (`l2.ttl_secs[category]`)
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub to_l1: bool,
    pub to_l2: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            category: None,
            tags: Vec::new(),
            to_l1: true,
            to_l2: true,
        }
    }
}

impl SetOptions {
    /// Both tiers, category default TTL, no tags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn l1_only() -> Self {
        Self { to_l2: false, ..Self::default() }
    }

    #[must_use]
    pub fn l2_only() -> Self {
        Self { to_l1: false, ..Self::default() }
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn ttl_secs(self, secs: u64) -> Self {
        self.ttl(Duration::from_secs(secs))
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Lifecycle notification published on the cache's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { key: String, tier: Tier },
    Miss { key: String },
    Set { key: String },
    Delete { key: String },
    /// Tag or pattern invalidation; `tag` holds the pattern for the latter
    Invalidate { tag: String, count: u64 },
}

/// L2 counters as seen from this process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct L2Stats {
    /// False when no store is configured or `l2.enabled` is off
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    /// Failed or rejected L2 calls, plus undecodable values
    pub errors: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OverallStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub sets: u64,
    pub deletes: u64,
    pub write_behind_failures: u64,
}

/// Point-in-time counters, see [`super::TieredCache::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1: L1Stats,
    pub l2: L2Stats,
    pub overall: OverallStats,
    pub circuit_breaker: CircuitSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct L1Health {
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct L2Health {
    pub enabled: bool,
    /// `None` when L2 isn't configured
    pub connected: Option<bool>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Result of [`super::TieredCache::health_check`].
///
/// Serializes straight into a `/health` response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// L2 reachable or not configured
    pub healthy: bool,
    pub l1: L1Health,
    pub l2: L2Health,
    pub circuit_breaker: CircuitState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display() {
        assert_eq!(format!("{}", Tier::L1), "L1");
        assert_eq!(Tier::L2.to_string(), "L2");
    }

    #[test]
    fn test_set_options_defaults() {
        let options = SetOptions::default();
        assert!(options.to_l1);
        assert!(options.to_l2);
        assert!(options.ttl.is_none());
        assert!(options.tags.is_empty());
    }

    #[test]
    fn test_set_options_builder() {
        let options = SetOptions::l2_only()
            .ttl_secs(60)
            .category("job")
            .tag("job")
            .tags(vec!["job:42".to_string()]);

        assert!(!options.to_l1);
        assert!(options.to_l2);
        assert_eq!(options.ttl, Some(Duration::from_secs(60)));
        assert_eq!(options.category.as_deref(), Some("job"));
        assert_eq!(options.tags, vec!["job", "job:42"]);
    }

    #[test]
    fn test_health_serializes() {
        let health = HealthCheck {
            healthy: true,
            l1: L1Health { entries: 1, memory_bytes: 10, max_entries: 100, max_memory_bytes: 1000 },
            l2: L2Health { enabled: false, connected: None, latency_ms: None, error: None },
            circuit_breaker: CircuitState::Closed,
        };

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["circuit_breaker"], "closed");
        assert_eq!(json["l2"]["connected"], serde_json::Value::Null);
    }
}
