//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by render-forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all render-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal state, labeled by outcome (ready, error, timeout).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Render wall time in seconds, labeled by outcome.
pub static RENDER_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs accepted but not yet picked up by a worker.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Workers currently rendering.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Rate-limit denials, labeled by endpoint and reason.
pub static RATE_LIMIT_DENIALS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Circuit breaker state per circuit (0 closed, 1 half-open, 2 open).
pub static CIRCUIT_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Upstream generation calls, labeled by status.
pub static GENERATION_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Upstream generation latency in seconds.
pub static GENERATION_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Jobs evicted by the resource manager, labeled by pass.
pub static CLEANUP_EVICTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Last sampled system memory usage in percent.
pub static MEMORY_PERCENT: OnceLock<Gauge> = OnceLock::new();

/// Last sampled CPU usage in percent.
pub static CPU_PERCENT: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("render_forge_jobs_total", "Jobs that reached a terminal state"),
        &["outcome"],
    )?;

    let render_duration = HistogramVec::new(
        HistogramOpts::new(
            "render_forge_render_duration_seconds",
            "Render wall time in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 180.0, 300.0]),
        &["outcome"],
    )?;

    let queue_depth = Gauge::new(
        "render_forge_queue_depth",
        "Jobs accepted but not yet picked up by a worker",
    )?;

    let active_workers = Gauge::new("render_forge_active_workers", "Workers currently rendering")?;

    let rate_limit_denials = CounterVec::new(
        Opts::new("render_forge_rate_limit_denials_total", "Rate-limit denials"),
        &["endpoint", "reason"],
    )?;

    let circuit_state = GaugeVec::new(
        Opts::new(
            "render_forge_circuit_state",
            "Circuit breaker state (0 closed, 1 half-open, 2 open)",
        ),
        &["circuit"],
    )?;

    let generation_requests = CounterVec::new(
        Opts::new("render_forge_generation_requests_total", "Upstream generation calls"),
        &["status"],
    )?;

    let generation_latency = Histogram::with_opts(
        HistogramOpts::new(
            "render_forge_generation_latency_seconds",
            "Upstream generation latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )?;

    let cleanup_evictions = CounterVec::new(
        Opts::new("render_forge_cleanup_evictions_total", "Jobs evicted by cleanup"),
        &["pass"],
    )?;

    let memory_percent = Gauge::new("render_forge_memory_percent", "System memory usage in percent")?;
    let cpu_percent = Gauge::new("render_forge_cpu_percent", "CPU usage in percent")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(render_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(rate_limit_denials.clone()))?;
    registry.register(Box::new(circuit_state.clone()))?;
    registry.register(Box::new(generation_requests.clone()))?;
    registry.register(Box::new(generation_latency.clone()))?;
    registry.register(Box::new(cleanup_evictions.clone()))?;
    registry.register(Box::new(memory_percent.clone()))?;
    registry.register(Box::new(cpu_percent.clone()))?;

    // Already-set cells mean metrics were initialized earlier.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = RENDER_DURATION.set(render_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = RATE_LIMIT_DENIALS_TOTAL.set(rate_limit_denials);
    let _ = CIRCUIT_STATE.set(circuit_state);
    let _ = GENERATION_REQUESTS_TOTAL.set(generation_requests);
    let _ = GENERATION_LATENCY.set(generation_latency);
    let _ = CLEANUP_EVICTIONS_TOTAL.set(cleanup_evictions);
    let _ = MEMORY_PERCENT.set(memory_percent);
    let _ = CPU_PERCENT.set(cpu_percent);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&["ready"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("render_forge_jobs_total"));
    }
}
