//! TTL cache over the shared store with an in-process fallback.
//!
//! Callers see one `get`/`set`/`delete` surface. Underneath, every call goes
//! to the shared store until it becomes unreachable, then to an in-process
//! store until a periodic probe finds the shared store again (see
//! [`backend`]). Only connectivity failures trigger the fallback; a store that
//! answers with an error surfaces that error.
//!
//! [`CacheLayer::get_or_compute`] adds stampede protection: concurrent misses
//! on one key serialize on a lock named after the key, and only the first
//! holder runs `compute`.
//!
//! Entries live under [`ENTRY_PREFIX`] in whichever store is active, so a
//! store shared with locks and rate windows can back the cache, and
//! [`CacheLayer::size`] / [`CacheLayer::clear`] only see cache entries.

mod backend;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use self::backend::Backends;
use crate::config::CacheConfig;
use crate::error::{CacheError, LockError};
use crate::lock::{DistributedLock, LockGuard};
use crate::metrics::CoordinationMetrics;
use crate::store::{KeyValueStore, MemoryStore};

/// Store key prefix of every cache entry
pub const ENTRY_PREFIX: &str = "cache:";

fn entry_key(key: &str) -> String {
    format!("{ENTRY_PREFIX}{key}")
}

/// Lock name guarding the fill of `key`
fn fill_key(key: &str) -> String {
    format!("cache-fill:{key}")
}

#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<Inner>,
}

struct Inner {
    backends: Backends,
    /// Fill locks on the shared store, used while it is reachable
    shared_locks: Option<DistributedLock>,
    /// Fill locks scoped to this process, used under fallback
    local_locks: DistributedLock,
    config: CacheConfig,
}

impl CacheLayer {
    /// Cache backed by `primary`, probed once up front.
    ///
    /// An unreachable primary is not an error: the cache starts degraded and
    /// keeps probing every `config.probe_interval`.
    pub async fn connect(primary: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        let layer = Self::build(Some(primary.clone()), config);
        match primary.ping().await {
            Ok(()) => debug!(backend = primary.backend_name(), "Cache backend reachable"),
            Err(e) => layer.inner.backends.mark_degraded(&e).await,
        }
        layer
    }

    /// Cache that never leaves the current process.
    pub fn in_process(config: CacheConfig) -> Self {
        Self::build(None, config)
    }

    fn build(primary: Option<Arc<dyn KeyValueStore>>, config: CacheConfig) -> Self {
        let shared_locks = primary.clone().map(DistributedLock::new);
        Self {
            inner: Arc::new(Inner {
                backends: Backends::new(primary, config.probe_interval),
                shared_locks,
                local_locks: DistributedLock::new(Arc::new(MemoryStore::new())),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Whether a configured shared store is currently being bypassed.
    pub fn is_degraded(&self) -> bool {
        self.inner.backends.is_degraded()
    }

    /// Name of the store the next call would use.
    pub async fn backend_name(&self) -> &'static str {
        if !self.inner.backends.has_primary() {
            return "memory";
        }
        self.inner.backends.current().await.store.backend_name()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let value = self.peek(key).await?;
        if value.is_some() {
            CoordinationMetrics::cache_hit(key);
        } else {
            CoordinationMetrics::cache_miss(key);
        }
        Ok(value)
    }

    /// Write with expiry. Last writer wins.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let stored = entry_key(key);
        let stored = stored.as_str();
        self.inner
            .backends
            .run(|store| async move { store.set(stored, value, ttl).await })
            .await?;
        debug!(key, ttl_secs = ttl.as_secs(), "Cache set");
        Ok(())
    }

    /// Write with `config.default_ttl`.
    pub async fn set_default(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.set(key, value, self.inner.config.default_ttl).await
    }

    /// Write a batch in one round trip, atomically on stores that support it.
    pub async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<(), CacheError> {
        let stored: Vec<(String, Vec<u8>)> = entries
            .iter()
            .map(|(key, value)| (entry_key(key), value.clone()))
            .collect();
        let stored = stored.as_slice();
        self.inner
            .backends
            .run(|store| async move { store.set_many(stored, ttl).await })
            .await?;
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let stored = entry_key(key);
        let stored = stored.as_str();
        Ok(self
            .inner
            .backends
            .run(|store| async move { store.delete(stored).await })
            .await?)
    }

    /// Live entries in the active store. Fill locks are not counted.
    pub async fn size(&self) -> Result<usize, CacheError> {
        Ok(self
            .inner
            .backends
            .run(|store| async move { store.count_prefixed(ENTRY_PREFIX).await })
            .await?)
    }

    /// Drop every cache entry of the active store, leaving other keys alone.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let removed = self
            .inner
            .backends
            .run(|store| async move { store.delete_prefixed(ENTRY_PREFIX).await })
            .await?;
        warn!(removed, "Cache cleared");
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.get(key)
            .await?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(CacheError::from)
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, ttl).await
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// Under concurrent misses `compute` runs once system-wide while the
    /// shared store is reachable, and once per process under fallback. Other
    /// callers wait on the fill lock (bounded by `config.fill_lock.max_wait`)
    /// and then read the stored value.
    ///
    /// # Example
    /// ```ignore
    /// let key = CacheKey::embedding(text, model);
    /// let vector: Vec<f32> = cache
    ///     .get_or_compute(key.as_str(), config.embedding_ttl, || async {
    ///         provider.embed(text).await.map_err(CoordinationError::operation)
    ///     })
    ///     .await?;
    /// ```
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get_json::<T>(key).await? {
            return Ok(value);
        }

        let mut guard = match self.fill_lock(key).await {
            Ok(guard) => guard,
            Err(CacheError::Lock(timeout @ LockError::Timeout { .. })) => {
                // The holder is slow; its value may still have landed.
                return match self.lookup::<T>(key).await? {
                    Some(value) => Ok(value),
                    None => Err(CacheError::Lock(timeout).into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(value) = self.lookup::<T>(key).await? {
            debug!(key, "Cache filled while waiting for lock");
            release_fill(key, guard).await;
            return Ok(value);
        }

        let started = Instant::now();
        let value = match self.renewing(key, &mut guard, compute()).await {
            Ok(value) => value,
            Err(e) => {
                release_fill(key, guard).await;
                return Err(e);
            }
        };
        CoordinationMetrics::cache_computed(key, started.elapsed());

        // Store before releasing so waiters find the value on re-check.
        if let Err(e) = self.set_json(key, &value, ttl).await {
            warn!(key, error = %e, "Computed value was not cached");
        }
        release_fill(key, guard).await;

        Ok(value)
    }

    async fn peek(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let stored = entry_key(key);
        let stored = stored.as_str();
        Ok(self
            .inner
            .backends
            .run(|store| async move { store.get(stored).await })
            .await?)
    }

    /// Read and decode without counting a hit or miss.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.peek(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn fill_lock(&self, key: &str) -> Result<LockGuard, CacheError> {
        let options = self.inner.config.fill_lock.options();
        let key = fill_key(key);
        let key = key.as_str();

        if let Some(shared) = &self.inner.shared_locks {
            if !self.inner.backends.is_degraded() {
                match shared.lock(key, options).await {
                    Ok(guard) => return Ok(guard),
                    Err(LockError::Backend(e)) if e.is_unavailable() => {
                        self.inner.backends.mark_degraded(&e).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(self.inner.local_locks.lock(key, options).await?)
    }

    /// Drive `computing` while renewing the fill lock every half TTL, so a
    /// compute that outlives one TTL does not let a waiter start another.
    async fn renewing<T>(
        &self,
        key: &str,
        guard: &mut LockGuard,
        computing: impl Future<Output = T>,
    ) -> T {
        let ttl = self.inner.config.fill_lock.ttl;
        let period = (ttl / 2).max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        let mut holding = true;
        tokio::pin!(computing);

        loop {
            tokio::select! {
                output = &mut computing => return output,
                _ = ticks.tick(), if holding => {
                    if let Err(e) = guard.renew(ttl).await {
                        warn!(key, error = %e, "Fill lock renewal failed, another caller may compute");
                        holding = false;
                    }
                }
            }
        }
    }
}

async fn release_fill(key: &str, guard: LockGuard) {
    if let Err(e) = guard.release().await {
        warn!(key, error = %e, "Fill lock release failed, record will expire");
    }
}
