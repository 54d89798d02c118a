use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{KeyValueStore, StoreResult, WindowCount};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Writes between sweeps of expired entries.
const SWEEP_EVERY: usize = 256;

/// In-process store scoped to the current instance.
///
/// Every primitive runs under one mutex, which makes it atomic within the
/// process and nothing more. Expiry uses `tokio::time::Instant`, so tests can
/// drive it with `tokio::time::pause()` / `advance()`.
///
/// Expired entries go when their key is touched again, and in a full sweep
/// every few hundred writes so keys that are never read do not pile up.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a write and sweep when due. Called with the map locked.
    fn wrote(&self, entries: &mut HashMap<String, Entry>, count: usize) {
        let before = self.writes.fetch_add(count, Ordering::Relaxed);
        if before / SWEEP_EVERY != (before + count) / SWEEP_EVERY {
            let now = Instant::now();
            entries.retain(|_, e| e.is_live(now));
        }
    }
}

/// Drop the entry under `key` if it has expired, returning the live one.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry::new(value.to_vec(), ttl));
        self.wrote(&mut entries, 1);
        Ok(())
    }

    async fn set_many(&self, batch: &[(String, Vec<u8>)], ttl: Duration) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        for (key, value) in batch {
            entries.insert(key.clone(), Entry::new(value.clone(), ttl));
        }
        self.wrote(&mut entries, batch.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn count_prefixed(&self, prefix: &str) -> StoreResult<usize> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .iter()
            .filter(|(key, e)| key.starts_with(prefix) && e.is_live(now))
            .count())
    }

    async fn delete_prefixed(&self, prefix: &str) -> StoreResult<usize> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        let mut expired = 0;
        entries.retain(|key, e| {
            if !key.starts_with(prefix) {
                return true;
            }
            if !e.is_live(now) {
                expired += 1;
            }
            false
        });
        Ok(before - entries.len() - expired)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key, Instant::now()).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value.to_vec(), ttl));
        self.wrote(&mut entries, 1);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let owned = live(&mut entries, key, Instant::now()).is_some_and(|e| e.value == expected);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, Instant::now()) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_window(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if live(&mut entries, key, now).is_none() {
            entries.insert(key.to_string(), Entry::new(b"0".to_vec(), window));
        }
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::Command(format!("counter '{key}' vanished")))?;

        let current: u64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::Command(format!("value at '{key}' is not a counter")))?;
        let count = current + 1;
        entry.value = count.to_string().into_bytes();

        Ok(WindowCount {
            count,
            resets_in: entry.expires_at.saturating_duration_since(now),
        })
    }
}
