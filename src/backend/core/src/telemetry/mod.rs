//! Telemetry infrastructure: structured logging and metrics export.
//!
//! Logging uses `tracing` with JSON output for production and pretty output
//! for development. Metrics use the `metrics` facade with an optional
//! Prometheus exporter; the cache, queue, and rate-limit modules record their
//! counters and histograms through it.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsHandle};
