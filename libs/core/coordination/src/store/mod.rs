//! Backing store protocol.
//!
//! Locks, semaphores, rate windows and cache entries all live in one
//! key-value store. The primitives below are the whole contract: each one must
//! be atomic in the store itself, so callers never read-then-write.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{HealthStatus, RedisStore};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of an atomic window increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// Time until the window resets
    pub resets_in: Duration,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Short backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Connectivity probe.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Unconditional write with expiry (last writer wins).
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Write several entries as one atomic batch.
    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> StoreResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Number of live keys starting with `prefix`.
    async fn count_prefixed(&self, prefix: &str) -> StoreResult<usize>;

    /// Drop every key starting with `prefix`, returning how many went.
    /// Keys outside the prefix are untouched.
    async fn delete_prefixed(&self, prefix: &str) -> StoreResult<usize>;

    /// Atomic set-if-absent with expiry. Returns `true` when the write won.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Delete only if the stored value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Reset the expiry only if the stored value equals `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &[u8], ttl: Duration)
        -> StoreResult<bool>;

    /// Atomic increment of a window counter. The first increment of a fresh
    /// key starts the window and sets its expiry to `window`.
    async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount>;
}
