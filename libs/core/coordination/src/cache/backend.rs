use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::metrics::CoordinationMetrics;
use crate::store::{KeyValueStore, MemoryStore, StoreResult};

/// Chooses between the shared store and the in-process fallback.
///
/// Starts on the primary. The first `Unavailable` error flips to the fallback
/// and logs once; while degraded, at most one caller per `probe_interval`
/// pings the primary, and a successful ping flips back (logged once).
/// Entries written to the fallback during an outage are not copied back.
pub(crate) struct Backends {
    primary: Option<Arc<dyn KeyValueStore>>,
    fallback: Arc<dyn KeyValueStore>,
    degraded: AtomicBool,
    last_probe: Mutex<Instant>,
    probe_interval: Duration,
}

pub(crate) struct Selected {
    pub store: Arc<dyn KeyValueStore>,
    pub is_primary: bool,
}

impl Backends {
    pub fn new(primary: Option<Arc<dyn KeyValueStore>>, probe_interval: Duration) -> Self {
        Self {
            primary,
            fallback: Arc::new(MemoryStore::new()),
            degraded: AtomicBool::new(false),
            last_probe: Mutex::new(Instant::now()),
            probe_interval,
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// True while a configured primary is being bypassed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub async fn current(&self) -> Selected {
        let Some(primary) = &self.primary else {
            return self.fallback();
        };

        if !self.is_degraded() {
            return Selected {
                store: primary.clone(),
                is_primary: true,
            };
        }

        if self.probe_due() {
            match primary.ping().await {
                Ok(()) => {
                    self.mark_recovered();
                    return Selected {
                        store: primary.clone(),
                        is_primary: true,
                    };
                }
                Err(e) => debug!(error = %e, "Cache backend still unavailable"),
            }
        }

        self.fallback()
    }

    fn fallback(&self) -> Selected {
        Selected {
            store: self.fallback.clone(),
            is_primary: false,
        }
    }

    /// Run `op` against the current backend, retrying once on the fallback if
    /// the primary turns out to be unreachable. Command errors are returned.
    pub async fn run<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: Fn(Arc<dyn KeyValueStore>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let selected = self.current().await;
        match op(selected.store).await {
            Err(e) if selected.is_primary && e.is_unavailable() => {
                self.mark_degraded(&e).await;
                op(self.fallback.clone()).await
            }
            result => result,
        }
    }

    pub async fn mark_degraded(&self, cause: &StoreError) {
        *self.last_probe.lock().await = Instant::now();
        if !self.degraded.swap(true, Ordering::AcqRel) {
            CoordinationMetrics::cache_degraded(true);
            warn!(
                error = %cause,
                retry_in_secs = self.probe_interval.as_secs(),
                "Cache backend unavailable, serving from in-process fallback"
            );
        }
    }

    fn mark_recovered(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            CoordinationMetrics::cache_degraded(false);
            info!("Cache backend recovered, leaving in-process fallback");
        }
    }

    fn probe_due(&self) -> bool {
        // Contended: another caller is checking right now.
        let Ok(mut last) = self.last_probe.try_lock() else {
            return false;
        };

        let now = Instant::now();
        if now.duration_since(*last) >= self.probe_interval {
            *last = now;
            true
        } else {
            false
        }
    }
}
