//! Cross-process mutual exclusion.
//!
//! A lock is a `lock:<key>` record holding the holder's random token, written
//! with set-if-absent and an expiry. Release and renew compare the token
//! first, so a holder whose lock expired and was taken over can never delete
//! or extend the new holder's record.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::metrics::CoordinationMetrics;
use crate::retry::RetryConfig;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Expiry of the lock record; bounds hold time if the holder dies
    pub ttl: Duration,
    /// Retry on contention until `max_wait` elapses
    pub blocking: bool,
    pub max_wait: Duration,
}

impl LockOptions {
    pub fn blocking(ttl: Duration, max_wait: Duration) -> Self {
        Self {
            ttl,
            blocking: true,
            max_wait,
        }
    }

    /// Single attempt; contention fails immediately.
    pub fn non_blocking(ttl: Duration) -> Self {
        Self {
            ttl,
            blocking: false,
            max_wait: Duration::ZERO,
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::blocking(Duration::from_secs(30), Duration::from_secs(30))
    }
}

/// Proof of ownership for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Expiry requested by the last acquire or renew.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn held_for(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

fn store_key(key: &str) -> String {
    format!("{KEY_PREFIX}:{key}")
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    backoff: RetryConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            backoff: RetryConfig::polling(),
        }
    }

    /// Override the delay sequence used while waiting on a held lock.
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Acquire `key`, waiting up to `options.max_wait` when blocking.
    ///
    /// A store failure aborts immediately with [`LockError::Backend`]; there
    /// is no local substitute for a cross-process lock.
    pub async fn acquire(&self, key: &str, options: LockOptions) -> Result<LockHandle, LockError> {
        let record = store_key(key);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut backoff = self.backoff.backoff();
        let mut contended = false;

        loop {
            if self
                .store
                .set_if_absent(&record, token.as_bytes(), options.ttl)
                .await?
            {
                let waited = started.elapsed();
                CoordinationMetrics::lock_acquired(key, waited);
                debug!(key, waited_ms = waited.as_millis() as u64, "Lock acquired");

                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                    acquired_at: Utc::now(),
                    ttl: options.ttl,
                });
            }

            if !contended {
                contended = true;
                CoordinationMetrics::lock_contended(key);
                debug!(key, blocking = options.blocking, "Lock held elsewhere");
            }

            let waited = started.elapsed();
            if !options.blocking || waited >= options.max_wait {
                CoordinationMetrics::lock_timeout(key);
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: if options.blocking { waited } else { Duration::ZERO },
                });
            }

            tokio::time::sleep(backoff.next_delay_within(options.max_wait - waited)).await;
        }
    }

    /// Delete the record if this handle still owns it.
    ///
    /// Returns `false` when the lock had already expired or was taken over;
    /// that case is a no-op, not an error.
    pub async fn release(&self, handle: LockHandle) -> Result<bool, LockError> {
        let owned = self
            .store
            .compare_and_delete(&store_key(&handle.key), handle.token.as_bytes())
            .await?;

        CoordinationMetrics::lock_released(&handle.key, handle.held_for(), owned);
        if owned {
            debug!(key = %handle.key, "Lock released");
        } else {
            warn!(key = %handle.key, "Lock release skipped, no longer the owner");
        }
        Ok(owned)
    }

    /// Reset the expiry to `ttl` if this handle still owns the lock.
    pub async fn renew(&self, handle: &mut LockHandle, ttl: Duration) -> Result<(), LockError> {
        let renewed = self
            .store
            .compare_and_expire(&store_key(&handle.key), handle.token.as_bytes(), ttl)
            .await?;

        if !renewed {
            warn!(key = %handle.key, "Lock renewal failed, lock lost");
            return Err(LockError::Lost {
                key: handle.key.clone(),
            });
        }

        handle.ttl = ttl;
        debug!(key = %handle.key, ttl_ms = ttl.as_millis() as u64, "Lock renewed");
        Ok(())
    }

    /// Acquire and wrap the handle in a guard that releases on drop.
    pub async fn lock(&self, key: &str, options: LockOptions) -> Result<LockGuard, LockError> {
        let handle = self.acquire(key, options).await?;
        Ok(LockGuard {
            lock: self.clone(),
            handle: Some(handle),
        })
    }

    /// Run `work` while holding `key`; the lock is released on every exit path.
    ///
    /// # Example
    /// ```ignore
    /// let embedding = locks
    ///     .with_lock(key.as_str(), config.embedding_lock.options(), || async {
    ///         provider.embed(text).await.map_err(CoordinationError::operation)
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        key: &str,
        options: LockOptions,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.lock(key, options).await?;
        let result = work().await;
        if let Err(e) = guard.release().await {
            warn!(key, error = %e, "Lock release failed, record will expire");
        }
        result
    }
}

/// Releases its lock when dropped.
///
/// Prefer [`LockGuard::release`], which reports the outcome. Dropping spawns
/// the release onto the current tokio runtime; outside a runtime the record
/// is left to expire.
pub struct LockGuard {
    lock: DistributedLock,
    handle: Option<LockHandle>,
}

impl LockGuard {
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub async fn renew(&mut self, ttl: Duration) -> Result<(), LockError> {
        match self.handle.as_mut() {
            Some(handle) => self.lock.renew(handle, ttl).await,
            None => Ok(()),
        }
    }

    pub async fn release(mut self) -> Result<bool, LockError> {
        match self.handle.take() {
            Some(handle) => self.lock.release(handle).await,
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let lock = self.lock.clone();
                runtime.spawn(async move {
                    let key = handle.key.clone();
                    if let Err(e) = lock.release(handle).await {
                        warn!(key = %key, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %handle.key, "Lock guard dropped outside a runtime, record will expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn locks() -> (DistributedLock, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DistributedLock::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_record_lives_under_lock_prefix() {
        let (locks, store) = locks();
        let handle = locks
            .acquire("embedding_lock:ab", LockOptions::default())
            .await
            .unwrap();

        let stored = store.get("lock:embedding_lock:ab").await.unwrap();
        assert_eq!(stored.as_deref(), Some(handle.token().as_bytes()));
    }

    #[tokio::test]
    async fn test_non_blocking_fails_fast_on_contention() {
        let (locks, _) = locks();
        let opts = LockOptions::non_blocking(Duration::from_secs(10));
        let _held = locks.acquire("k", opts).await.unwrap();

        match locks.acquire("k", opts).await {
            Err(LockError::Timeout { key, waited }) => {
                assert_eq!(key, "k");
                assert_eq!(waited, Duration::ZERO);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_waits_for_release() {
        let (locks, _) = locks();
        let first = locks.acquire("k", LockOptions::default()).await.unwrap();

        let releaser = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            releaser.release(first).await.unwrap();
        });

        let second = locks
            .acquire("k", LockOptions::blocking(Duration::from_secs(10), Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(second.key(), "k");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_times_out_after_max_wait() {
        let (locks, _) = locks();
        let _held = locks.acquire("k", LockOptions::default()).await.unwrap();

        let max_wait = Duration::from_millis(500);
        match locks
            .acquire("k", LockOptions::blocking(Duration::from_secs(10), max_wait))
            .await
        {
            Err(LockError::Timeout { waited, .. }) => assert!(waited >= max_wait),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_fails_once_expired() {
        let (locks, _) = locks();
        let mut handle = locks
            .acquire("k", LockOptions::non_blocking(Duration::from_secs(1)))
            .await
            .unwrap();

        locks.renew(&mut handle, Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.ttl(), Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(
            locks.renew(&mut handle, Duration::from_secs(5)).await,
            Err(LockError::Lost { .. })
        ));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let (locks, store) = locks();

        let result: Result<(), LockError> = locks
            .with_lock("k", LockOptions::default(), || async {
                Err(LockError::Lost { key: "inner".into() })
            })
            .await;

        assert!(result.is_err());
        assert!(store.get("lock:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let (locks, store) = locks();
        {
            let _guard = locks.lock("k", LockOptions::default()).await.unwrap();
        }

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.get("lock:k").await.unwrap().is_none());
    }
}
