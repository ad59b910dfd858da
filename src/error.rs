// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-level error.
//!
//! Reads and writes never surface these: a failed L2 call becomes a miss or
//! a no-op inside the coordinator. Only lock acquisition (`with_lock`) and
//! construction (`connect`) return a `CacheError` to the caller.

use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("lock unavailable for resource '{resource}'")]
    LockUnavailable { resource: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("circuit breaker open, L2 isolated")]
    CircuitOpen,
}

impl From<CircuitError<StorageError>> for CacheError {
    fn from(err: CircuitError<StorageError>) -> Self {
        match err {
            CircuitError::Rejected => CacheError::CircuitOpen,
            CircuitError::Inner(e) => CacheError::Storage(e),
        }
    }
}

impl CacheError {
    /// Short label for the `error_type` metric.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::LockUnavailable { .. } => "lock_unavailable",
            CacheError::Storage(StorageError::Backend(_)) => "backend",
            CacheError::Storage(StorageError::Serialization { .. }) | CacheError::Serialization(_) => "serialization",
            CacheError::CircuitOpen => "circuit_open",
        }
    }
}
