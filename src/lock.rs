// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distributed mutual exclusion over the shared store.
//!
//! A lock is the key `lock:{resource}` holding a random fencing token with a
//! lease TTL. Acquire is `SET NX PX`; release and extend compare the stored
//! token and act in one atomic step, so a holder whose lease lapsed can never
//! release or extend someone else's lock.
//!
//! Every call goes through the L2 circuit breaker. Acquisition fails closed:
//! a breaker rejection, a store error or a missing store all mean "no lock".
//!
//! # Example
//!
//! ```
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use tiered_cache::{CircuitBreaker, DistributedLock, InMemoryStore};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryStore::new());
//! let lock = DistributedLock::new(Some(store), Arc::new(CircuitBreaker::with_defaults("l2")), Duration::from_secs(30));
//!
//! let token = lock.acquire("payout:7", Duration::from_secs(30)).await.unwrap();
//! assert!(lock.acquire("payout:7", Duration::from_secs(30)).await.is_none());
//! assert!(lock.release("payout:7", &token).await);
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheError;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::storage::traits::{RemoteStore, StorageError, LOCK_KEY_PREFIX};

#[derive(Clone)]
pub struct DistributedLock {
    store: Option<Arc<dyn RemoteStore>>,
    breaker: Arc<CircuitBreaker>,
    default_ttl: Duration,
}

impl DistributedLock {
    pub fn new(
        store: Option<Arc<dyn RemoteStore>>,
        breaker: Arc<CircuitBreaker>,
        default_ttl: Duration,
    ) -> Self {
        Self { store, breaker, default_ttl }
    }

    /// Lease used when callers don't pass one.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    #[inline]
    fn lock_key(resource: &str) -> String {
        format!("{}{}", LOCK_KEY_PREFIX, resource)
    }

    /// Try once to take the lock. Returns the fencing token, or `None` if the
    /// resource is held or the store is unreachable. A zero lease is refused.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Option<String> {
        if ttl.is_zero() {
            warn!(resource = %resource, "Zero lease requested, lock not granted");
            crate::metrics::record_lock("acquire", "invalid_ttl");
            return None;
        }
        let Some(store) = &self.store else {
            warn!(resource = %resource, "No shared store configured, lock not granted");
            crate::metrics::record_lock("acquire", "no_store");
            return None;
        };

        let key = Self::lock_key(resource);
        let token = Uuid::new_v4().to_string();

        match self.breaker.call(|| store.set_if_absent(&key, &token, ttl)).await {
            Ok(true) => {
                debug!(resource = %resource, ttl = ?ttl, "Lock acquired");
                crate::metrics::record_lock("acquire", "acquired");
                Some(token)
            }
            Ok(false) => {
                debug!(resource = %resource, "Lock held elsewhere");
                crate::metrics::record_lock("acquire", "contended");
                None
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Lock acquisition failed, failing closed");
                crate::metrics::record_lock("acquire", outcome_label(&e));
                None
            }
        }
    }

    /// Release only if `token` is the one currently stored.
    /// A stale or foreign token is a no-op and returns `false`.
    pub async fn release(&self, resource: &str, token: &str) -> bool {
        let Some(store) = &self.store else { return false };
        let key = Self::lock_key(resource);

        match self.breaker.call(|| store.compare_and_delete(&key, token)).await {
            Ok(released) => {
                if !released {
                    debug!(resource = %resource, "Release ignored, token does not hold the lock");
                }
                crate::metrics::record_lock("release", if released { "released" } else { "not_held" });
                released
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Lock release failed, lease will expire by TTL");
                crate::metrics::record_lock("release", outcome_label(&e));
                false
            }
        }
    }

    /// Reset the lease to `ttl` if `token` still holds the lock.
    /// A zero `ttl` is refused and leaves the lease untouched.
    pub async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let Some(store) = &self.store else { return false };
        if ttl.is_zero() {
            warn!(resource = %resource, "Zero lease extension refused");
            crate::metrics::record_lock("extend", "invalid_ttl");
            return false;
        }
        let key = Self::lock_key(resource);

        match self.breaker.call(|| store.compare_and_expire(&key, token, ttl)).await {
            Ok(extended) => {
                crate::metrics::record_lock("extend", if extended { "extended" } else { "not_held" });
                extended
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Lock extension failed");
                crate::metrics::record_lock("extend", outcome_label(&e));
                false
            }
        }
    }

    /// Acquire and wrap the token in a guard that releases on drop.
    pub async fn lock(&self, resource: &str, ttl: Duration) -> Result<LockGuard, CacheError> {
        match self.acquire(resource, ttl).await {
            Some(token) => Ok(LockGuard {
                lock: self.clone(),
                resource: resource.to_string(),
                token,
                released: false,
            }),
            None => Err(CacheError::LockUnavailable { resource: resource.to_string() }),
        }
    }

    /// Run `f` while holding the lock.
    ///
    /// Fails with [`CacheError::LockUnavailable`] without running `f` if the
    /// lock can't be taken. The lock is released when `f` completes, and
    /// also if `f` panics or the returned future is dropped early.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, ttl: Duration, f: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(resource, ttl).await?;
        let result = f().await;
        guard.release().await;
        Ok(result)
    }
}

fn outcome_label(err: &CircuitError<StorageError>) -> &'static str {
    if err.is_rejected() { "rejected" } else { "error" }
}

/// A held lock. Dropping it without calling [`release`](Self::release)
/// releases it from a spawned task.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    lock: DistributedLock,
    resource: String,
    token: String,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn extend(&self, ttl: Duration) -> bool {
        self.lock.extend(&self.resource, &self.token, ttl).await
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        self.lock.release(&self.resource, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        let resource = std::mem::take(&mut self.resource);
        let token = std::mem::take(&mut self.token);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    lock.release(&resource, &token).await;
                });
            }
            Err(_) => {
                warn!(resource = %resource, "Lock guard dropped outside a runtime, lease will expire by TTL");
            }
        }
    }
}
