//! Circuit breaker for upstream calls.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[recovery_timeout since last failure]-----> HalfOpen
//! HalfOpen --[probe succeeds]--------------------------> Closed
//! HalfOpen --[probe fails]-----------------------------> Open (timer restarts)
//! ```
//!
//! While half-open exactly one caller runs the probe. Everyone else is
//! rejected as if the circuit were still open until the probe settles. A
//! probe whose future is dropped before finishing gives the slot back.
//!
//! The state lives behind a `std::sync::Mutex` that is never held across an
//! `.await`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::MetricsCollector;

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5).
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed (default: 60s).
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without reaching the upstream.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The call was rejected without invoking the operation.
    #[error("circuit '{0}' is open")]
    Open(String),

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open(_) => None,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one upstream.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

/// Holds the half-open probe slot until the probe settles.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
            metrics: MetricsCollector::new(),
        };
        breaker.publish(CircuitState::Closed);
        breaker
    }

    /// Runs `op` through the breaker.
    ///
    /// # Errors
    ///
    /// - `BreakerError::Open` if the circuit rejects the call; `op` is not
    ///   invoked
    /// - `BreakerError::Inner` with the operation's own error otherwise
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = self.admit().map_err(|()| BreakerError::Open(self.name.clone()))?;

        let result = op().await;

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        if let Some(probe) = probe {
            probe.disarm();
        }

        result.map_err(BreakerError::Inner)
    }

    /// Decides whether a call may proceed; returns the probe slot when the
    /// call is the half-open probe.
    fn admit(&self) -> Result<Option<ProbeGuard<'_>>, ()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .is_none_or(|at| now.duration_since(at) >= self.config.recovery_timeout);
                if !recovered {
                    return Err(());
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                drop(inner);
                info!(circuit = %self.name, "Circuit half-open, probing upstream");
                self.publish(CircuitState::HalfOpen);
                Ok(Some(ProbeGuard {
                    breaker: self,
                    armed: true,
                }))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(());
                }
                inner.probe_in_flight = true;
                Ok(Some(ProbeGuard {
                    breaker: self,
                    armed: true,
                }))
            }
        }
    }

    fn on_success(&self) {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.probe_in_flight = false;
            previous
        };

        if previous != CircuitState::Closed {
            info!(circuit = %self.name, "Circuit closed, upstream recovered");
            self.publish(CircuitState::Closed);
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let (previous, next, failures) = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_failure = Some(now);
            inner.probe_in_flight = false;
            if previous == CircuitState::HalfOpen
                || inner.consecutive_failures >= self.config.failure_threshold
            {
                inner.state = CircuitState::Open;
            }
            (previous, inner.state, inner.consecutive_failures)
        };

        if previous != CircuitState::Open && next == CircuitState::Open {
            warn!(
                circuit = %self.name,
                failures = failures,
                recovery_secs = self.config.recovery_timeout.as_secs(),
                "Circuit opened"
            );
            self.publish(CircuitState::Open);
        }
    }

    /// Current state. An open circuit whose recovery timeout has elapsed is
    /// reported as half-open.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let inner = self.lock();
        let recovered = inner
            .last_failure
            .is_none_or(|at| now.duration_since(at) >= self.config.recovery_timeout);
        match inner.state {
            CircuitState::Open if recovered => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Consecutive failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Forces the circuit closed and clears the failure count.
    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.last_failure = None;
            inner.probe_in_flight = false;
        }
        info!(circuit = %self.name, "Circuit reset");
        self.publish(CircuitState::Closed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn publish(&self, state: CircuitState) {
        self.metrics
            .update_circuit_state(&self.name, state.gauge_value());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
