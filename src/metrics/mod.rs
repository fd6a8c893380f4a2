//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for render-forge
//! operations: render outcomes, queue and worker occupancy, rate-limit
//! denials, circuit breaker state, upstream generation calls and cleanup.
//!
//! # Example
//!
//! ```ignore
//! use render_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_render("ready", 42.0);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CIRCUIT_STATE, CLEANUP_EVICTIONS_TOTAL, CPU_PERCENT, GENERATION_LATENCY,
    GENERATION_REQUESTS_TOTAL, JOBS_TOTAL, MEMORY_PERCENT, QUEUE_DEPTH, RATE_LIMIT_DENIALS_TOTAL,
    REGISTRY, RENDER_DURATION,
};
