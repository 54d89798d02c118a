//! Per-site tuning for the coordination primitives.
//!
//! The primitives take these values as arguments; nothing here is baked into
//! them. Defaults match the indexing and chat pipelines, and every value can
//! be overridden with a `COORD_*` environment variable.

use core_config::{env_duration_ms, env_duration_secs, env_parse, ConfigError, FromEnv};
use std::sync::Arc;
use std::time::Duration;

use crate::lock::{DistributedLock, LockOptions};
use crate::rate_limit::RateLimitRule;
use crate::retry::RetryConfig;
use crate::semaphore::Semaphore;
use crate::store::KeyValueStore;

/// Expiry and wait bound for one lock use-site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub ttl: Duration,
    pub max_wait: Duration,
}

impl LockPolicy {
    pub const fn new(ttl: Duration, max_wait: Duration) -> Self {
        Self { ttl, max_wait }
    }

    /// Blocking acquisition bounded by `max_wait`.
    pub fn options(&self) -> LockOptions {
        LockOptions::blocking(self.ttl, self.max_wait)
    }

    fn from_env(prefix: &str, default: Self) -> Result<Self, ConfigError> {
        Ok(Self {
            ttl: env_duration_secs(&format!("{prefix}_TTL_SECS"), default.ttl)?,
            max_wait: env_duration_secs(&format!("{prefix}_MAX_WAIT_SECS"), default.max_wait)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphorePolicy {
    pub limit: u32,
    pub timeout: Duration,
}

impl SemaphorePolicy {
    pub const fn new(limit: u32, timeout: Duration) -> Self {
        Self { limit, timeout }
    }

    fn from_env(prefix: &str, default: Self) -> Result<Self, ConfigError> {
        Ok(Self {
            limit: env_parse(&format!("{prefix}_LIMIT"), default.limit)?,
            timeout: env_duration_secs(&format!("{prefix}_TIMEOUT_SECS"), default.timeout)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub embedding_ttl: Duration,
    pub search_ttl: Duration,
    pub classification_ttl: Duration,
    /// How often a degraded cache re-probes the shared store
    pub probe_interval: Duration,
    /// Lock taken by `get_or_compute` while filling a missing key
    pub fill_lock: LockPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            embedding_ttl: Duration::from_secs(3600),
            search_ttl: Duration::from_secs(1800),
            classification_ttl: Duration::from_secs(3600),
            probe_interval: Duration::from_secs(30),
            fill_lock: LockPolicy::new(Duration::from_secs(60), Duration::from_secs(60)),
        }
    }
}

impl FromEnv for CacheConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            default_ttl: env_duration_secs("COORD_CACHE_DEFAULT_TTL_SECS", defaults.default_ttl)?,
            embedding_ttl: env_duration_secs(
                "COORD_CACHE_EMBEDDING_TTL_SECS",
                defaults.embedding_ttl,
            )?,
            search_ttl: env_duration_secs("COORD_CACHE_SEARCH_TTL_SECS", defaults.search_ttl)?,
            classification_ttl: env_duration_secs(
                "COORD_CACHE_CLASSIFICATION_TTL_SECS",
                defaults.classification_ttl,
            )?,
            probe_interval: env_duration_secs(
                "COORD_CACHE_PROBE_INTERVAL_SECS",
                defaults.probe_interval,
            )?,
            fill_lock: LockPolicy::from_env("COORD_CACHE_FILL_LOCK", defaults.fill_lock)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationConfig {
    pub cache: CacheConfig,

    /// Delay sequence while polling a held lock or a full semaphore
    pub lock_poll: RetryConfig,

    pub embedding_lock: LockPolicy,
    pub search_lock: LockPolicy,
    pub upsert_batch_lock: LockPolicy,

    /// Expiry of a semaphore slot whose holder vanished without releasing
    pub semaphore_permit_ttl: Duration,
    pub embedding_batch: SemaphorePolicy,
    pub vector_upsert: SemaphorePolicy,

    pub chat_stream: RateLimitRule,
    pub chat_user: RateLimitRule,
    pub vector_search: RateLimitRule,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            lock_poll: RetryConfig::polling(),
            embedding_lock: LockPolicy::new(Duration::from_secs(60), Duration::from_secs(60)),
            search_lock: LockPolicy::new(Duration::from_secs(30), Duration::from_secs(30)),
            upsert_batch_lock: LockPolicy::new(Duration::from_secs(300), Duration::from_secs(300)),
            semaphore_permit_ttl: Duration::from_secs(600),
            embedding_batch: SemaphorePolicy::new(3, Duration::from_secs(300)),
            vector_upsert: SemaphorePolicy::new(2, Duration::from_secs(600)),
            chat_stream: RateLimitRule::per_minute(60),
            chat_user: RateLimitRule::per_minute(30),
            vector_search: RateLimitRule::per_minute(100),
        }
    }
}

impl CoordinationConfig {
    /// Lock client over `store` using `lock_poll`.
    pub fn lock(&self, store: Arc<dyn KeyValueStore>) -> DistributedLock {
        DistributedLock::new(store).with_backoff(self.lock_poll.clone())
    }

    /// Semaphore client over `store` using `lock_poll` and `semaphore_permit_ttl`.
    pub fn semaphore(&self, store: Arc<dyn KeyValueStore>) -> Semaphore {
        Semaphore::new(store)
            .with_permit_ttl(self.semaphore_permit_ttl)
            .with_backoff(self.lock_poll.clone())
    }
}

fn rule_from_env(prefix: &str, default: RateLimitRule) -> Result<RateLimitRule, ConfigError> {
    Ok(RateLimitRule::new(
        env_parse(&format!("{prefix}_LIMIT"), default.limit)?,
        env_duration_secs(&format!("{prefix}_WINDOW_SECS"), default.window)?,
    ))
}

impl FromEnv for CoordinationConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            cache: CacheConfig::from_env()?,
            lock_poll: RetryConfig::polling()
                .with_initial_delay(env_duration_ms(
                    "COORD_LOCK_POLL_INITIAL_MS",
                    defaults.lock_poll.initial_delay,
                )?)
                .with_max_delay(env_duration_ms(
                    "COORD_LOCK_POLL_MAX_MS",
                    defaults.lock_poll.max_delay,
                )?),
            embedding_lock: LockPolicy::from_env("COORD_LOCK_EMBEDDING", defaults.embedding_lock)?,
            search_lock: LockPolicy::from_env("COORD_LOCK_SEARCH", defaults.search_lock)?,
            upsert_batch_lock: LockPolicy::from_env(
                "COORD_LOCK_UPSERT_BATCH",
                defaults.upsert_batch_lock,
            )?,
            semaphore_permit_ttl: env_duration_secs(
                "COORD_SEMAPHORE_PERMIT_TTL_SECS",
                defaults.semaphore_permit_ttl,
            )?,
            embedding_batch: SemaphorePolicy::from_env(
                "COORD_SEMAPHORE_EMBEDDING_BATCH",
                defaults.embedding_batch,
            )?,
            vector_upsert: SemaphorePolicy::from_env(
                "COORD_SEMAPHORE_VECTOR_UPSERT",
                defaults.vector_upsert,
            )?,
            chat_stream: rule_from_env("COORD_RATE_CHAT_STREAM", defaults.chat_stream)?,
            chat_user: rule_from_env("COORD_RATE_CHAT_USER", defaults.chat_user)?,
            vector_search: rule_from_env("COORD_RATE_VECTOR_SEARCH", defaults.vector_search)?,
        })
    }
}
