//! Error taxonomy for the coordination primitives.
//!
//! Errors are categorized by what the caller is expected to do with them:
//! - **Recoverable**: timeouts and admission denials, retry or back off
//! - **BackendUnavailable**: the shared store is unreachable; fatal for
//!   locks, semaphores and rate limits (the cache recovers locally)
//! - **Inconsistent**: a compensation failed, operator intervention needed
//! - **Failed**: everything else (step failures, rollbacks, bad input)

use std::time::Duration;
use thiserror::Error;

use crate::saga::SagaError;
use crate::transaction::TransactionError;

/// Category of error for deciding how a caller reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Recoverable,
    BackendUnavailable,
    Inconsistent,
    Failed,
}

/// Failure talking to the shared key-value store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Connection refused, dropped or timed out
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but rejected the command
    #[error("backing store command failed: {0}")]
    Command(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Not acquired within `max_wait` (zero for non-blocking attempts)
    #[error("timed out after {waited:?} waiting for lock '{key}'")]
    Timeout { key: String, waited: Duration },

    /// Renewal found the lock expired or held by someone else
    #[error("lock '{key}' is no longer held by this handle")]
    Lost { key: String },

    #[error("lock backend error: {0}")]
    Backend(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error("no permit for '{resource}' (limit {limit}) within {waited:?}")]
    Timeout {
        resource: String,
        limit: u32,
        waited: Duration,
    },

    #[error("semaphore '{0}' needs a limit of at least 1")]
    InvalidLimit(String),

    #[error("semaphore backend error: {0}")]
    Backend(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Admission denied; `remaining` is always 0
    #[error("rate limit exceeded for '{scope}', retry after {retry_after:?}")]
    Exceeded {
        scope: String,
        remaining: u64,
        retry_after: Duration,
    },

    #[error("rate limiter backend error: {0}")]
    Backend(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] StoreError),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache fill lock error: {0}")]
    Lock(#[from] LockError),
}

/// Unified error for callers that mix several primitives in one operation
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Saga(#[from] SagaError),

    /// Failure raised by caller-supplied work (compute closures, unit-of-work bodies)
    #[error("operation failed: {0}")]
    Operation(String),
}

impl CoordinationError {
    pub fn operation(message: impl Into<String>) -> Self {
        CoordinationError::Operation(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CoordinationError::Store(e) => store_category(e),
            CoordinationError::Lock(LockError::Backend(e))
            | CoordinationError::Semaphore(SemaphoreError::Backend(e))
            | CoordinationError::RateLimit(RateLimitError::Backend(e))
            | CoordinationError::Cache(CacheError::Backend(e)) => store_category(e),
            CoordinationError::Cache(CacheError::Lock(LockError::Backend(e))) => {
                store_category(e)
            }
            CoordinationError::Lock(LockError::Timeout { .. })
            | CoordinationError::Cache(CacheError::Lock(LockError::Timeout { .. }))
            | CoordinationError::Semaphore(SemaphoreError::Timeout { .. })
            | CoordinationError::RateLimit(RateLimitError::Exceeded { .. }) => {
                ErrorCategory::Recoverable
            }
            CoordinationError::Saga(e) if e.is_inconsistent() => ErrorCategory::Inconsistent,
            _ => ErrorCategory::Failed,
        }
    }

    /// Timeouts and admission denials; the caller may retry or back off.
    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Recoverable
    }
}

fn store_category(err: &StoreError) -> ErrorCategory {
    if err.is_unavailable() {
        ErrorCategory::BackendUnavailable
    } else {
        ErrorCategory::Failed
    }
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;
