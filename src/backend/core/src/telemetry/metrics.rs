//! Prometheus metrics export for the cache, queue, and rate-limit gate.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for response durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}

/// Handle for rendering collected metrics (e.g. for a `/metrics` endpoint
/// served by the dashboard).
pub struct MetricsHandle {
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MetricsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsHandle")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

/// Initialize the metrics subsystem.
///
/// Installs a Prometheus recorder as the global `metrics` recorder. If a
/// recorder is already installed (tests, embedding applications), metrics
/// still flow to the existing recorder and the returned handle renders
/// nothing.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsHandle> {
    if !config.enabled {
        return Ok(MetricsHandle {
            prometheus_handle: None,
        });
    }

    let builder = PrometheusBuilder::new().set_buckets(&config.duration_buckets)?;

    let handle = match builder.install_recorder() {
        Ok(handle) => Some(handle),
        Err(_) => {
            tracing::debug!("Metrics recorder already installed, reusing existing one");
            None
        }
    };

    register_metric_descriptions();

    Ok(MetricsHandle {
        prometheus_handle: handle,
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    // Cache metrics
    describe_counter!("cache_hits_total", "Total number of cache hits");
    describe_counter!("cache_misses_total", "Total number of cache misses");
    describe_counter!("cache_sets_total", "Total number of cache writes");
    describe_counter!("cache_deletes_total", "Total number of cache deletes");
    describe_histogram!(
        "cache_lookup_duration_seconds",
        "Cache lookup duration in seconds"
    );

    // Task queue metrics
    describe_gauge!("task_queue_depth", "Number of tasks waiting in the queue");
    describe_gauge!("task_queue_running", "Number of tasks currently running");
    describe_counter!("task_completed_total", "Total number of completed tasks");
    describe_counter!("task_failed_total", "Total number of permanently failed tasks");
    describe_counter!("task_retries_total", "Total number of task retry attempts");

    // Rate limit metrics
    describe_counter!(
        "rate_limit_blocks_total",
        "Times an endpoint call waited on an active rate-limit window"
    );
    describe_counter!(
        "rate_limit_windows_total",
        "Rate-limit windows recorded after a 429 response"
    );

    // Errors
    describe_counter!("mesh_errors_total", "Total errors by code and category");
}
