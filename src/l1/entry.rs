// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

/// A value held by the L1 tier plus its expiry, tags and access bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub tags: HashSet<String>,
    pub access_count: u64,
    pub last_accessed: Instant,
    /// Serialized size, used for the memory budget
    pub size_bytes: usize,
    /// Logical LRU clock; strictly increasing per cache, so ties can't happen
    pub(crate) access_seq: u64,
}

impl CacheEntry {
    /// `ttl` must be non-zero so that `expires_at > created_at`.
    pub(crate) fn new(
        value: serde_json::Value,
        size_bytes: usize,
        ttl: Duration,
        tags: HashSet<String>,
        now: Instant,
        seq: u64,
    ) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            tags,
            access_count: 0,
            last_accessed: now,
            size_bytes,
            access_seq: seq,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn record_access(&mut self, now: Instant, seq: u64) {
        self.last_accessed = now;
        self.access_seq = seq;
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Time left before the entry expires (zero once expired).
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry_boundary() {
        let now = Instant::now();
        let entry = CacheEntry::new(json!(1), 1, Duration::from_secs(10), HashSet::new(), now, 0);

        assert!(entry.expires_at > entry.created_at);
        assert!(!entry.is_expired(now + Duration::from_millis(9_999)));
        assert!(entry.is_expired(now + Duration::from_secs(10)));
        assert_eq!(entry.remaining_ttl(now + Duration::from_secs(4)), Duration::from_secs(6));
        assert_eq!(entry.remaining_ttl(now + Duration::from_secs(11)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_access() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(json!("v"), 3, Duration::from_secs(1), HashSet::new(), now, 1);

        let later = now + Duration::from_millis(200);
        entry.record_access(later, 7);

        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.last_accessed, later);
        assert_eq!(entry.access_seq, 7);
    }
}
