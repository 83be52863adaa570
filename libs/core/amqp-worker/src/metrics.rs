//! Prometheus metrics for AMQP workers

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

use crate::connection::ConnectionState;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another recorder
/// is already installed the failure is logged and `/metrics` stays empty.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .inspect(|_| info!("Prometheus metrics initialized"))
            .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Worker metrics helper, labelled by worker name
#[derive(Clone)]
pub struct WorkerMetrics {
    worker: String,
}

impl WorkerMetrics {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }

    pub fn delivery_received(&self, routing_key: &str) {
        counter!(
            "amqp_worker_deliveries_received_total",
            "worker" => self.worker.clone(),
            "routing_key" => routing_key.to_string()
        )
        .increment(1);
    }

    /// Record a persisted delivery and how long the sink took
    pub fn delivery_acked(&self, sink: &'static str, duration: Duration) {
        counter!(
            "amqp_worker_deliveries_acked_total",
            "worker" => self.worker.clone(),
            "sink" => sink
        )
        .increment(1);

        histogram!(
            "amqp_worker_sink_duration_seconds",
            "worker" => self.worker.clone(),
            "sink" => sink
        )
        .record(duration.as_secs_f64());
    }

    /// `kind` is [`WorkerError::kind`](crate::WorkerError::kind)
    pub fn delivery_rejected(&self, kind: &str, requeued: bool) {
        counter!(
            "amqp_worker_deliveries_rejected_total",
            "worker" => self.worker.clone(),
            "kind" => kind.to_string(),
            "requeued" => requeued.to_string()
        )
        .increment(1);
    }

    /// Deliveries dropped because their session was replaced
    pub fn stale_delivery(&self) {
        counter!(
            "amqp_worker_stale_deliveries_total",
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    pub fn connect_attempt(&self, success: bool) {
        counter!(
            "amqp_worker_connect_attempts_total",
            "worker" => self.worker.clone(),
            "status" => if success { "success" } else { "failed" }
        )
        .increment(1);
    }

    pub fn connection_lost(&self) {
        counter!(
            "amqp_worker_connection_lost_total",
            "worker" => self.worker.clone()
        )
        .increment(1);
    }

    /// 0 disconnected, 1 connecting, 2 connected, 3 shutting down
    pub fn connection_state(&self, state: ConnectionState) {
        gauge!(
            "amqp_worker_connection_state",
            "worker" => self.worker.clone()
        )
        .set(state.as_gauge());
    }
}
