// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding calls to the L2 backing store.
//!
//! Provides protection against hammering a dead Redis: after enough
//! consecutive failures the breaker "trips" and callers fail fast, then it
//! cautiously probes recovery.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Service unhealthy, requests fail-fast without attempting
//! - HalfOpen: Testing if service recovered, at most `half_open_max_calls`
//!   trial requests admitted
//!
//! ```text
//!            failures >= threshold                reset_timeout elapsed
//!  Closed ───────────────────────────▶ Open ───────────────────────────▶ HalfOpen
//!    ▲                                   ▲                                   │
//!    │                                   └──────────── any failure ──────────┤
//!    └─────────────────── half_open_max_calls successes ─────────────────────┘
//! ```
//!
//! The state lock is only held for bookkeeping, never across the wrapped
//! future's `.await`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call without running it
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long to stay open before admitting trial calls
    pub reset_timeout: Duration,
    /// Trial calls admitted while half-open; this many successes close the circuit
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls_made: u32,
    last_failure: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls_made: 0,
            last_failure: None,
        }
    }
}

/// Point-in-time view of a breaker, for stats and health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// Settles an admitted call whose future is dropped mid-flight.
struct Admitted<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.on_trial_cancelled();
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, mut config: CircuitConfig) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        config.half_open_max_calls = config.half_open_max_calls.max(1);

        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get current circuit state.
    ///
    /// An open breaker whose reset timeout has elapsed still reports `Open`
    /// until the next call moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, so a rejected call never
    /// constructs (let alone polls) the operation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(trial) = self.try_admit() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected);
        };

        let mut admitted = Admitted { breaker: self, trial, settled: false };
        let outcome = f().await;
        admitted.settled = true;

        match outcome {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Force the breaker open, as if the failure threshold had just been hit.
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner, Instant::now());
    }

    /// Force the breaker closed and forget all failure history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerState::new();
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
    }

    /// `None` rejects the call; `Some(true)` admits it as a half-open trial.
    fn try_admit(&self) -> Option<bool> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .last_failure
                .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);
            if !cooled_down {
                return None;
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_calls_made = 0;
            inner.success_count = 0;
            debug!(circuit = %self.name, "Circuit breaker half-open, probing backend");
            crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen as u8);
        }

        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen => {
                if inner.half_open_calls_made >= self.config.half_open_max_calls {
                    return None;
                }
                inner.half_open_calls_made += 1;
                Some(true)
            }
            CircuitState::Open => None,
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_calls_made = 0;
                    info!(circuit = %self.name, "Circuit breaker closed, backend recovered");
                    crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
                }
            }
            // A call admitted before the trip finished late; it proves nothing.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => self.open(&mut inner, now),
            CircuitState::Open => {}
        }
    }

    /// A half-open trial was dropped before it finished. Its slot would
    /// otherwise stay taken forever, so the breaker re-opens and waits out a
    /// fresh reset timeout.
    fn on_trial_cancelled(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            debug!(circuit = %self.name, "Trial call cancelled before completing");
            self.open(&mut inner, Instant::now());
        }
    }

    fn open(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.last_failure = Some(now);
        inner.half_open_calls_made = 0;
        inner.success_count = 0;
        warn!(
            circuit = %self.name,
            failures = inner.failure_count,
            reset_timeout = ?self.config.reset_timeout,
            "Circuit breaker opened"
        );
        crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let (state, consecutive_failures) = {
            let inner = self.inner.lock();
            (inner.state, inner.failure_count)
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state,
            consecutive_failures,
            calls_total: self.calls_total(),
            successes: self.successes(),
            failures: self.failures(),
            rejections: self.rejections(),
        }
    }
}
