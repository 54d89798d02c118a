//! Concurrency control and cross-store consistency for the indexing and chat
//! pipelines.
//!
//! Two stores that fail independently (the relational system of record and a
//! vector index with no transactions) are kept eventually consistent while
//! many requests compete for rate-limited resources. This crate provides the
//! pieces that make that safe:
//!
//! - [`fingerprint`]: deterministic keys for cache entries and locks
//! - [`CacheLayer`]: TTL cache with in-process fallback and stampede protection
//! - [`DistributedLock`]: cross-process mutual exclusion with token-checked release
//! - [`Semaphore`]: cross-process bounded concurrency
//! - [`RateLimiter`]: fixed-window admission control, global and per caller
//! - [`TransactionManager`]: scoped units of work with propagation modes
//! - [`Saga`]: ordered steps with reverse-order compensation
//!
//! Locks, semaphores, rate windows and the primary cache all live in one
//! [`KeyValueStore`] (Redis in production, [`MemoryStore`] for tests and
//! single-process use), passed explicitly to each primitive.
//!
//! # Example
//! ```ignore
//! use coordination::{CacheLayer, CoordinationConfig, DistributedLock, RedisStore};
//! use core_config::{redis::RedisConfig, FromEnv};
//! use std::sync::Arc;
//!
//! let config = CoordinationConfig::from_env()?;
//! let store: Arc<dyn KeyValueStore> =
//!     Arc::new(RedisStore::connect_with_retry(&RedisConfig::from_env()?, None).await?);
//!
//! let cache = CacheLayer::connect(store.clone(), config.cache.clone()).await;
//! let locks = DistributedLock::new(store.clone());
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod saga;
pub mod semaphore;
pub mod store;
pub mod transaction;

pub use cache::CacheLayer;
pub use config::{CacheConfig, CoordinationConfig, LockPolicy, SemaphorePolicy};
pub use error::{
    CacheError, CoordinationError, CoordinationResult, ErrorCategory, LockError, RateLimitError,
    SemaphoreError, StoreError,
};
pub use fingerprint::{fingerprint, CacheKey, Namespace};
pub use lock::{DistributedLock, LockGuard, LockHandle, LockOptions};
pub use metrics::{init_metrics, render_metrics, CoordinationMetrics};
pub use rate_limit::{RateDecision, RateLimitRule, RateLimiter, RateScope};
pub use retry::{retry, retry_with_backoff, RetryConfig};
pub use saga::{
    CompensationFailure, FnStep, Saga, SagaError, SagaReport, SagaState, SagaStep, StepError,
    StepReport, StepStatus,
};
pub use semaphore::{PermitGuard, Semaphore, SemaphorePermit};
pub use store::{HealthStatus, KeyValueStore, MemoryStore, RedisStore, WindowCount};
pub use transaction::{
    IsolationLevel, Propagation, TransactionContext, TransactionError, TransactionManager,
    TransactionOptions, TransactionState,
};
