//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op for metrics that have not been initialized, so
//! library code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, CIRCUIT_STATE, CLEANUP_EVICTIONS_TOTAL, CPU_PERCENT, GENERATION_LATENCY,
    GENERATION_REQUESTS_TOTAL, JOBS_TOTAL, MEMORY_PERCENT, QUEUE_DEPTH, RATE_LIMIT_DENIALS_TOTAL,
    RENDER_DURATION,
};

/// Metrics collector for recording render-forge operational metrics.
///
/// # Example
///
/// ```ignore
/// use render_forge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_render("timeout", 180.0);
/// collector.record_rate_limit_denial("/api/render", "rate_limited");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `outcome` - "ready", "error" or "timeout"
    /// * `duration_secs` - Render wall time in seconds
    pub fn record_render(&self, outcome: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome]).inc();
        }

        if let Some(render_duration) = RENDER_DURATION.get() {
            render_duration
                .with_label_values(&[outcome])
                .observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded render metric"
        );
    }

    pub fn update_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }
    }

    pub fn update_active_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Record a request rejected by the rate limiter.
    pub fn record_rate_limit_denial(&self, endpoint: &str, reason: &str) {
        if let Some(denials) = RATE_LIMIT_DENIALS_TOTAL.get() {
            denials.with_label_values(&[endpoint, reason]).inc();
        }

        tracing::trace!(endpoint = endpoint, reason = reason, "Recorded rate-limit denial");
    }

    /// Update the state gauge of a named circuit.
    ///
    /// # Arguments
    ///
    /// * `circuit` - Circuit name
    /// * `state` - 0 for closed, 1 for half-open, 2 for open
    pub fn update_circuit_state(&self, circuit: &str, state: u8) {
        if let Some(circuit_state) = CIRCUIT_STATE.get() {
            circuit_state
                .with_label_values(&[circuit])
                .set(f64::from(state));
        }
    }

    /// Record one upstream generation call.
    pub fn record_generation_request(&self, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(requests) = GENERATION_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[status]).inc();
        }

        if let Some(latency) = GENERATION_LATENCY.get() {
            latency.observe(latency_secs);
        }

        tracing::trace!(
            status = status,
            latency_secs = latency_secs,
            "Recorded generation request metric"
        );
    }

    /// Record evictions performed by one cleanup pass.
    pub fn record_cleanup(&self, pass: &str, evicted: usize) {
        if let Some(evictions) = CLEANUP_EVICTIONS_TOTAL.get() {
            evictions.with_label_values(&[pass]).inc_by(evicted as f64);
        }
    }

    /// Update the sampled resource usage gauges; `None` leaves a gauge as is.
    pub fn update_resource_usage(&self, memory_percent: Option<f64>, cpu_percent: Option<f64>) {
        if let (Some(gauge), Some(value)) = (MEMORY_PERCENT.get(), memory_percent) {
            gauge.set(value);
        }
        if let (Some(gauge), Some(value)) = (CPU_PERCENT.get(), cpu_percent) {
            gauge.set(value);
        }
    }
}
