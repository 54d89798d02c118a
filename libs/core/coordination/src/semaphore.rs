//! Cross-process bounded concurrency.
//!
//! A resource with limit `n` owns `n` slot records,
//! `semaphore:<resource>:0` through `semaphore:<resource>:<n-1>`. A permit is
//! a slot claimed with set-if-absent and the holder's token, so the number of
//! outstanding permits can never exceed `n` no matter how many processes
//! compete. Slots expire after `permit_ttl` in case a holder dies.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SemaphoreError;
use crate::metrics::CoordinationMetrics;
use crate::retry::RetryConfig;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "semaphore";
const DEFAULT_PERMIT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphorePermit {
    resource: String,
    slot_id: u32,
    acquired_at: DateTime<Utc>,
    token: String,
}

impl SemaphorePermit {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn slot_id(&self) -> u32 {
        self.slot_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

fn slot_key(resource: &str, slot: u32) -> String {
    format!("{KEY_PREFIX}:{resource}:{slot}")
}

#[derive(Clone)]
pub struct Semaphore {
    store: Arc<dyn KeyValueStore>,
    permit_ttl: Duration,
    backoff: RetryConfig,
}

impl Semaphore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            permit_ttl: DEFAULT_PERMIT_TTL,
            backoff: RetryConfig::polling(),
        }
    }

    pub fn with_permit_ttl(mut self, ttl: Duration) -> Self {
        self.permit_ttl = ttl;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Claim a free slot of `resource`, waiting up to `timeout`.
    pub async fn acquire(
        &self,
        resource: &str,
        limit: u32,
        timeout: Duration,
    ) -> Result<SemaphorePermit, SemaphoreError> {
        if limit == 0 {
            return Err(SemaphoreError::InvalidLimit(resource.to_string()));
        }

        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut backoff = self.backoff.backoff();

        loop {
            for slot in 0..limit {
                if self
                    .store
                    .set_if_absent(&slot_key(resource, slot), token.as_bytes(), self.permit_ttl)
                    .await?
                {
                    let waited = started.elapsed();
                    CoordinationMetrics::permit_acquired(resource, waited);
                    debug!(resource, slot, limit, "Semaphore permit acquired");

                    return Ok(SemaphorePermit {
                        resource: resource.to_string(),
                        slot_id: slot,
                        acquired_at: Utc::now(),
                        token,
                    });
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                CoordinationMetrics::permit_timeout(resource);
                warn!(resource, limit, waited_ms = waited.as_millis() as u64, "Semaphore timeout");
                return Err(SemaphoreError::Timeout {
                    resource: resource.to_string(),
                    limit,
                    waited,
                });
            }

            tokio::time::sleep(backoff.next_delay_within(timeout - waited)).await;
        }
    }

    /// Free the permit's slot. `false` means the slot had expired and may
    /// already belong to someone else; it is left untouched.
    pub async fn release(&self, permit: SemaphorePermit) -> Result<bool, SemaphoreError> {
        let freed = self
            .store
            .compare_and_delete(&slot_key(&permit.resource, permit.slot_id), permit.token.as_bytes())
            .await?;

        if freed {
            debug!(resource = %permit.resource, slot = permit.slot_id, "Semaphore permit released");
        } else {
            warn!(
                resource = %permit.resource,
                slot = permit.slot_id,
                "Semaphore slot expired before release"
            );
        }
        Ok(freed)
    }

    /// Permits currently held for `resource`.
    pub async fn outstanding(&self, resource: &str, limit: u32) -> Result<usize, SemaphoreError> {
        let mut held = 0;
        for slot in 0..limit {
            if self.store.get(&slot_key(resource, slot)).await?.is_some() {
                held += 1;
            }
        }
        CoordinationMetrics::permits_outstanding(resource, held);
        Ok(held)
    }

    pub async fn guard(
        &self,
        resource: &str,
        limit: u32,
        timeout: Duration,
    ) -> Result<PermitGuard, SemaphoreError> {
        let permit = self.acquire(resource, limit, timeout).await?;
        Ok(PermitGuard {
            semaphore: self.clone(),
            permit: Some(permit),
        })
    }

    /// Run `work` under a permit, releasing it exactly once on every exit path.
    pub async fn with_permit<F, Fut, T, E>(
        &self,
        resource: &str,
        limit: u32,
        timeout: Duration,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SemaphoreError>,
    {
        let guard = self.guard(resource, limit, timeout).await?;
        let result = work().await;
        if let Err(e) = guard.release().await {
            warn!(resource, error = %e, "Semaphore release failed, slot will expire");
        }
        result
    }
}

/// Releases its permit when dropped, on the current tokio runtime.
pub struct PermitGuard {
    semaphore: Semaphore,
    permit: Option<SemaphorePermit>,
}

impl PermitGuard {
    pub fn permit(&self) -> Option<&SemaphorePermit> {
        self.permit.as_ref()
    }

    pub async fn release(mut self) -> Result<bool, SemaphoreError> {
        match self.permit.take() {
            Some(permit) => self.semaphore.release(permit).await,
            None => Ok(false),
        }
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let semaphore = self.semaphore.clone();
            runtime.spawn(async move {
                let resource = permit.resource.clone();
                if let Err(e) = semaphore.release(permit).await {
                    warn!(resource = %resource, error = %e, "Background permit release failed");
                }
            });
        } else {
            warn!(resource = %permit.resource, "Permit guard dropped outside a runtime, slot will expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn semaphore() -> Semaphore {
        Semaphore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_zero_limit_is_rejected() {
        let result = semaphore().acquire("r", 0, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SemaphoreError::InvalidLimit(_))));
    }

    #[tokio::test]
    async fn test_permits_take_distinct_slots() {
        let sem = semaphore();
        let a = sem.acquire("embedding_batch", 2, Duration::ZERO).await.unwrap();
        let b = sem.acquire("embedding_batch", 2, Duration::ZERO).await.unwrap();
        assert_ne!(a.slot_id(), b.slot_id());
        assert_eq!(sem.outstanding("embedding_batch", 2).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_full() {
        let sem = semaphore();
        let _held = sem.acquire("r", 1, Duration::ZERO).await.unwrap();

        match sem.acquire("r", 1, Duration::from_secs(2)).await {
            Err(SemaphoreError::Timeout { resource, limit, waited }) => {
                assert_eq!(resource, "r");
                assert_eq!(limit, 1);
                assert!(waited >= Duration::from_secs(2));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_permit_release_is_noop() {
        let sem = semaphore().with_permit_ttl(Duration::from_secs(1));
        let stale = sem.acquire("r", 1, Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = sem.acquire("r", 1, Duration::ZERO).await.unwrap();

        assert!(!sem.release(stale).await.unwrap());
        assert_eq!(sem.outstanding("r", 1).await.unwrap(), 1);
        assert!(sem.release(fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_permit_releases_on_failure() {
        let sem = semaphore();

        let result: Result<(), SemaphoreError> = sem
            .with_permit("r", 1, Duration::ZERO, || async {
                Err(SemaphoreError::InvalidLimit("downstream".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(sem.outstanding("r", 1).await.unwrap(), 0);
    }
}
