//! Prometheus metrics for partition workers
//!
//! [`PipelineMetrics`] is a cheap-to-clone handle: every event is emitted through the
//! `metrics` facade (labelled by topic) and also counted in process so tests and the
//! `/stats` endpoint can read totals without scraping.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

#[derive(Debug, Default)]
struct Totals {
    delivered: AtomicU64,
    transient_retry: AtomicU64,
    permanent_skip: AtomicU64,
    parked: AtomicU64,
    downstream_calls: AtomicU64,
}

/// Point-in-time copy of the in-process counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub delivered: u64,
    pub transient_retry: u64,
    pub permanent_skip: u64,
    pub parked: u64,
    pub downstream_calls: u64,
}

/// Pipeline metrics handle
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    totals: Arc<Totals>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message handed to the downstream successfully
    pub fn delivered(&self, topic: &str) {
        self.totals.delivered.fetch_add(1, Ordering::Relaxed);
        counter!("kafka_worker_delivered_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a transient failure that will be retried
    pub fn transient_retry(&self, topic: &str) {
        self.totals.transient_retry.fetch_add(1, Ordering::Relaxed);
        counter!("kafka_worker_transient_retry_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message skipped without side effects
    pub fn permanent_skip(&self, topic: &str, category: &'static str) {
        self.totals.permanent_skip.fetch_add(1, Ordering::Relaxed);
        counter!(
            "kafka_worker_permanent_skip_total",
            "topic" => topic.to_string(),
            "category" => category
        )
        .increment(1);
    }

    /// Record a message published to the dead-letter topic
    pub fn parked(&self, topic: &str, reason: &str) {
        self.totals.parked.fetch_add(1, Ordering::Relaxed);
        counter!(
            "kafka_worker_parked_total",
            "topic" => topic.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Record the latency of one downstream call (e.g. an MTA submission)
    pub fn downstream_call(&self, duration: Duration, outcome: &'static str) {
        self.totals.downstream_calls.fetch_add(1, Ordering::Relaxed);
        histogram!("kafka_worker_downstream_call_duration_seconds", "outcome" => outcome)
            .record(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            delivered: self.totals.delivered.load(Ordering::Relaxed),
            transient_retry: self.totals.transient_retry.load(Ordering::Relaxed),
            permanent_skip: self.totals.permanent_skip.load(Ordering::Relaxed),
            parked: self.totals.parked.load(Ordering::Relaxed),
            downstream_calls: self.totals.downstream_calls.load(Ordering::Relaxed),
        }
    }
}
