//! Prometheus collectors of the coordination components.
//!
//! Collectors live in an owned [`CoordMetrics`] value registered into a
//! caller supplied [`Registry`], so several nodes can run in one process
//! (tests, embedding) without sharing counters.
#[cfg(test)]
mod metrics_test;

use prometheus::exponential_buckets;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

use crate::Result;

pub const METRICS_NAMESPACE: &str = "dcoord";

#[derive(Clone, Debug)]
pub struct CoordMetrics {
    registry: Registry,

    /// Number of keys in a mirror, by watched prefix
    pub mirror_keys: IntGaugeVec,
    /// Last revision applied by a mirror, by watched prefix
    pub mirror_revision: IntGaugeVec,
    /// Restarts of a resilient watch stream, by watched prefix
    pub watch_restarts: IntCounterVec,
    /// Recoverable errors of a watch stream, by watched prefix
    pub watch_errors: IntCounterVec,

    pub tasks_started: IntCounterVec,
    /// Finished tasks, by task type and outcome ("succeeded" / "failed")
    pub tasks_finished: IntCounterVec,
    /// Tasks skipped because the lock was held
    pub tasks_ignored: IntCounterVec,
    pub task_duration_seconds: HistogramVec,
    pub tasks_running: IntGauge,
}

impl CoordMetrics {
    /// Creates the collectors and registers them into `registry`.
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            registry: registry.clone(),
            mirror_keys: IntGaugeVec::new(
                Opts::new("mirror_keys", "Number of keys in the mirror").namespace(METRICS_NAMESPACE),
                &["prefix"],
            )?,
            mirror_revision: IntGaugeVec::new(
                Opts::new("mirror_revision", "Last revision applied by the mirror")
                    .namespace(METRICS_NAMESPACE),
                &["prefix"],
            )?,
            watch_restarts: IntCounterVec::new(
                Opts::new("watch_restarts_total", "Restarts of the watch stream")
                    .namespace(METRICS_NAMESPACE),
                &["prefix"],
            )?,
            watch_errors: IntCounterVec::new(
                Opts::new("watch_errors_total", "Errors reported by the watch stream")
                    .namespace(METRICS_NAMESPACE),
                &["prefix"],
            )?,
            tasks_started: IntCounterVec::new(
                Opts::new("tasks_started_total", "Started tasks").namespace(METRICS_NAMESPACE),
                &["type"],
            )?,
            tasks_finished: IntCounterVec::new(
                Opts::new("tasks_finished_total", "Finished tasks").namespace(METRICS_NAMESPACE),
                &["type", "outcome"],
            )?,
            tasks_ignored: IntCounterVec::new(
                Opts::new("tasks_ignored_total", "Tasks ignored because the lock is in use")
                    .namespace(METRICS_NAMESPACE),
                &["type"],
            )?,
            task_duration_seconds: HistogramVec::new(
                HistogramOpts::new("task_duration_seconds", "Duration of finished tasks")
                    .namespace(METRICS_NAMESPACE)
                    .buckets(exponential_buckets(0.01, 2.0, 16)?),
                &["type"],
            )?,
            tasks_running: IntGauge::with_opts(
                Opts::new("tasks_running", "Currently running tasks").namespace(METRICS_NAMESPACE),
            )?,
        };

        registry.register(Box::new(metrics.mirror_keys.clone()))?;
        registry.register(Box::new(metrics.mirror_revision.clone()))?;
        registry.register(Box::new(metrics.watch_restarts.clone()))?;
        registry.register(Box::new(metrics.watch_errors.clone()))?;
        registry.register(Box::new(metrics.tasks_started.clone()))?;
        registry.register(Box::new(metrics.tasks_finished.clone()))?;
        registry.register(Box::new(metrics.tasks_ignored.clone()))?;
        registry.register(Box::new(metrics.task_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.tasks_running.clone()))?;
        Ok(metrics)
    }

    /// Creates the collectors in a fresh private registry.
    pub fn new() -> Result<Self> {
        Self::register(&Registry::new())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of all collectors, for a scrape endpoint.
    pub fn gather_text(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!("could not encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_else(|e| {
            warn!("metrics could not be from_utf8'd: {}", e);
            String::default()
        })
    }
}
