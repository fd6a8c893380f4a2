//! Calls to the external generation service.
//!
//! Every call goes through [`GuardedGenerator`], which wraps the raw
//! [`GenerationService`] in a circuit breaker and then in retry with backoff:
//!
//! ```text
//! retry_with_backoff ──▶ CircuitBreaker::call ──▶ GenerationService::generate
//! ```
//!
//! A rejection by the breaker is never retried; it surfaces immediately as
//! [`GenerationError::CircuitOpen`].

pub mod http;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::metrics::MetricsCollector;
use crate::resilience::{retry_with_backoff, BreakerError, CircuitBreaker, RetryPolicy};

pub use http::HttpGenerationService;

/// A text generation backend.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Generates text for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Generation client guarded by a circuit breaker and retry policy.
pub struct GuardedGenerator {
    service: Arc<dyn GenerationService>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    metrics: MetricsCollector,
}

impl GuardedGenerator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            breaker,
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    /// Generates text for `prompt`, retrying transient upstream failures.
    ///
    /// # Errors
    ///
    /// - `GenerationError::CircuitOpen` if the breaker rejected the call
    /// - the last upstream error once retries are exhausted
    /// - a non-retryable upstream error as soon as it occurs
    pub async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let started = Instant::now();

        let result = retry_with_backoff(
            &self.policy,
            |err: &BreakerError<GenerationError>| match err {
                BreakerError::Open(_) => false,
                BreakerError::Inner(inner) => inner.is_retryable(),
            },
            || self.breaker.call(|| self.service.generate(prompt)),
        )
        .await;

        let latency = started.elapsed().as_secs_f64();
        self.metrics.record_generation_request(result.is_ok(), latency);

        match result {
            Ok(text) => {
                debug!(
                    circuit = %self.breaker.name(),
                    latency_ms = (latency * 1000.0) as u64,
                    chars = text.len(),
                    "Generation succeeded"
                );
                Ok(text)
            }
            Err(BreakerError::Open(name)) => {
                warn!(circuit = %name, "Generation rejected, circuit open");
                Err(GenerationError::CircuitOpen(name))
            }
            Err(BreakerError::Inner(err)) => {
                warn!(circuit = %self.breaker.name(), error = %err, "Generation failed");
                Err(err)
            }
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
