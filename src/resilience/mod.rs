//! Resilience primitives for calls to upstream services.
//!
//! - [`CircuitBreaker`] stops calling an upstream that keeps failing and lets
//!   a single probe through once it has had time to recover.
//! - [`retry_with_backoff`] repeats transient failures with exponential
//!   backoff and jitter.
//!
//! The two compose: retry wraps the breaker, and the caller classifies
//! [`BreakerError::Open`] as non-retryable so an open circuit fails fast.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{retry_with_backoff, RetryPolicy};
