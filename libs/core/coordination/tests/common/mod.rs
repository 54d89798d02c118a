//! Store doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use coordination::store::StoreResult;
use coordination::{KeyValueStore, MemoryStore, StoreError, WindowCount};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn refused() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

/// A store that is never reachable.
pub struct DownStore;

#[async_trait]
impl KeyValueStore for DownStore {
    fn backend_name(&self) -> &'static str {
        "down"
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(refused())
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(refused())
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> StoreResult<()> {
        Err(refused())
    }

    async fn set_many(&self, _entries: &[(String, Vec<u8>)], _ttl: Duration) -> StoreResult<()> {
        Err(refused())
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        Err(refused())
    }

    async fn count_prefixed(&self, _prefix: &str) -> StoreResult<usize> {
        Err(refused())
    }

    async fn delete_prefixed(&self, _prefix: &str) -> StoreResult<usize> {
        Err(refused())
    }

    async fn set_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> StoreResult<bool> {
        Err(refused())
    }

    async fn compare_and_delete(&self, _key: &str, _expected: &[u8]) -> StoreResult<bool> {
        Err(refused())
    }

    async fn compare_and_expire(
        &self,
        _key: &str,
        _expected: &[u8],
        _ttl: Duration,
    ) -> StoreResult<bool> {
        Err(refused())
    }

    async fn increment_window(&self, _key: &str, _window: Duration) -> StoreResult<WindowCount> {
        Err(refused())
    }
}

/// A memory-backed store that can be switched off and on, counting every
/// call it receives.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn come_back(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(refused())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()?;
        self.inner.ping().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.inner.set_many(entries, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn count_prefixed(&self, prefix: &str) -> StoreResult<usize> {
        self.check()?;
        self.inner.count_prefixed(prefix).await
    }

    async fn delete_prefixed(&self, prefix: &str) -> StoreResult<usize> {
        self.check()?;
        self.inner.delete_prefixed(prefix).await
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.check()?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner.compare_and_expire(key, expected, ttl).await
    }

    async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        self.check()?;
        self.inner.increment_window(key, window).await
    }
}
