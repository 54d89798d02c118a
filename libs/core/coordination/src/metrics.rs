//! Prometheus metrics for the coordination primitives
//!
//! Keys carry a fingerprint, so labels use only the namespace prefix
//! (`embedding_lock`, `vector_search`, ...) to keep cardinality bounded.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

use crate::fingerprint::namespace_of;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

fn label(key: &str) -> String {
    namespace_of(key).to_string()
}

/// Metric recording helpers
pub struct CoordinationMetrics;

impl CoordinationMetrics {
    pub fn lock_acquired(key: &str, waited: Duration) {
        counter!("coordination_lock_acquired_total", "namespace" => label(key)).increment(1);
        histogram!("coordination_lock_wait_seconds", "namespace" => label(key))
            .record(waited.as_secs_f64());
    }

    pub fn lock_contended(key: &str) {
        counter!("coordination_lock_contended_total", "namespace" => label(key)).increment(1);
    }

    pub fn lock_timeout(key: &str) {
        counter!("coordination_lock_timeout_total", "namespace" => label(key)).increment(1);
    }

    pub fn lock_released(key: &str, held: Duration, owned: bool) {
        counter!(
            "coordination_lock_released_total",
            "namespace" => label(key),
            "status" => if owned { "released" } else { "stale" }
        )
        .increment(1);
        histogram!("coordination_lock_hold_seconds", "namespace" => label(key))
            .record(held.as_secs_f64());
    }

    pub fn permit_acquired(resource: &str, waited: Duration) {
        counter!("coordination_semaphore_acquired_total", "resource" => resource.to_string())
            .increment(1);
        histogram!("coordination_semaphore_wait_seconds", "resource" => resource.to_string())
            .record(waited.as_secs_f64());
    }

    pub fn permit_timeout(resource: &str) {
        counter!("coordination_semaphore_timeout_total", "resource" => resource.to_string())
            .increment(1);
    }

    pub fn permits_outstanding(resource: &str, outstanding: usize) {
        gauge!("coordination_semaphore_outstanding", "resource" => resource.to_string())
            .set(outstanding as f64);
    }

    /// `scope` is the rule name (`chat:user`), never the per-caller key.
    pub fn rate_decision(scope: &str, allowed: bool) {
        counter!(
            "coordination_rate_limit_total",
            "scope" => scope.to_string(),
            "decision" => if allowed { "allowed" } else { "denied" }
        )
        .increment(1);
    }

    pub fn cache_hit(key: &str) {
        counter!("coordination_cache_requests_total", "namespace" => label(key), "result" => "hit")
            .increment(1);
    }

    pub fn cache_miss(key: &str) {
        counter!("coordination_cache_requests_total", "namespace" => label(key), "result" => "miss")
            .increment(1);
    }

    pub fn cache_computed(key: &str, duration: Duration) {
        histogram!("coordination_cache_compute_seconds", "namespace" => label(key))
            .record(duration.as_secs_f64());
    }

    /// 1 while the cache serves from the in-process fallback
    pub fn cache_degraded(degraded: bool) {
        gauge!("coordination_cache_degraded").set(if degraded { 1.0 } else { 0.0 });
    }

    pub fn transaction_finished(outcome: &str) {
        counter!("coordination_transactions_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn saga_finished(name: &str, state: &str, duration: Duration) {
        counter!(
            "coordination_sagas_total",
            "saga" => name.to_string(),
            "state" => state.to_string()
        )
        .increment(1);
        histogram!("coordination_saga_duration_seconds", "saga" => name.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn compensation_failed(name: &str, step_id: &str) {
        counter!(
            "coordination_compensation_failures_total",
            "saga" => name.to_string(),
            "step" => step_id.to_string()
        )
        .increment(1);
    }
}
