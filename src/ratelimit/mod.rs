//! Sliding-window rate limiting with blocklist escalation.
//!
//! Each `(identity, endpoint)` pair keeps the instants of its admitted
//! requests within the trailing window. A request is admitted while fewer than
//! `max_requests` instants remain after evicting expired ones. Every denial
//! adds to the identity's suspicion count; at `block_threshold` the identity
//! is blocklisted and denied on every endpoint until the block expires or is
//! cleared.

pub mod config;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::MetricsCollector;

pub use config::{EndpointLimit, RateLimitConfig};

/// Result of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The window for this endpoint is full.
    RateLimited {
        limit: u32,
        window: Duration,
        /// Time until the oldest request in the window expires.
        retry_after: Duration,
    },
    /// The identity is on the blocklist.
    Blocked { reason: String },
}

impl DenyReason {
    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DenyReason::RateLimited { .. } => "rate_limited",
            DenyReason::Blocked { .. } => "blocked",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DenyReason::RateLimited { retry_after, .. } => Some(*retry_after),
            DenyReason::Blocked { .. } => None,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RateLimited { limit, window, .. } => write!(
                f,
                "rate limit exceeded: {} requests per {} seconds",
                limit,
                window.as_secs()
            ),
            DenyReason::Blocked { .. } => f.write_str("blocked"),
        }
    }
}

#[derive(Debug, Clone)]
struct BlockEntry {
    reason: String,
    expires_at: Option<Instant>,
}

impl BlockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type WindowKey = (String, String);

/// Per-identity, per-endpoint sliding-window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: DashMap<WindowKey, VecDeque<Instant>>,
    suspicion: DashMap<String, u32>,
    blocklist: DashMap<String, BlockEntry>,
    metrics: MetricsCollector,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: DashMap::new(),
            suspicion: DashMap::new(),
            blocklist: DashMap::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Admits or denies one request from `identity` to `endpoint`.
    ///
    /// The request is counted against the window only when admitted.
    pub fn check(&self, identity: &str, endpoint: &str) -> Decision {
        let now = self.clock.now();

        if let Some(reason) = self.active_block(identity, now) {
            let reason = DenyReason::Blocked { reason };
            self.metrics.record_rate_limit_denial(endpoint, reason.kind());
            debug!(identity = %identity, endpoint = %endpoint, "Blocked identity denied");
            return Decision::Denied(reason);
        }

        let limit = self.config.limit_for(endpoint);
        let window = limit.window();
        let retry_after = {
            let mut timestamps = self
                .windows
                .entry((identity.to_string(), endpoint.to_string()))
                .or_default();
            while timestamps
                .front()
                .is_some_and(|t| now.duration_since(*t) >= window)
            {
                timestamps.pop_front();
            }

            if timestamps.len() < limit.max_requests as usize {
                timestamps.push_back(now);
                return Decision::Allowed;
            }

            timestamps
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window)
        };

        let reason = DenyReason::RateLimited {
            limit: limit.max_requests,
            window,
            retry_after,
        };
        self.metrics.record_rate_limit_denial(endpoint, reason.kind());
        debug!(
            identity = %identity,
            endpoint = %endpoint,
            retry_after_secs = retry_after.as_secs(),
            "Rate limit exceeded"
        );
        self.record_denial(identity, now);

        Decision::Denied(reason)
    }

    fn record_denial(&self, identity: &str, now: Instant) {
        let count = {
            let mut count = self.suspicion.entry(identity.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if count >= self.config.block_threshold {
            let reason = format!("{count} rate-limit violations");
            warn!(identity = %identity, violations = count, "Identity blocklisted");
            self.blocklist.insert(
                identity.to_string(),
                BlockEntry {
                    reason,
                    expires_at: self.block_expiry(now),
                },
            );
        }
    }

    /// Returns the block reason if `identity` is currently blocked, lifting
    /// expired blocks on the way.
    fn active_block(&self, identity: &str, now: Instant) -> Option<String> {
        {
            let entry = self.blocklist.get(identity)?;
            if !entry.is_expired(now) {
                return Some(entry.reason.clone());
            }
        }

        if self
            .blocklist
            .remove_if(identity, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.suspicion.remove(identity);
            info!(identity = %identity, "Block expired");
        }
        None
    }

    /// Deadline of a block placed at `now`. A duration too long to represent
    /// never expires.
    fn block_expiry(&self, now: Instant) -> Option<Instant> {
        self.config
            .block_duration()
            .and_then(|duration| now.checked_add(duration))
    }

    /// Blocklists `identity` explicitly.
    pub fn block(&self, identity: &str, reason: impl Into<String>) {
        let now = self.clock.now();
        self.blocklist.insert(
            identity.to_string(),
            BlockEntry {
                reason: reason.into(),
                expires_at: self.block_expiry(now),
            },
        );
        warn!(identity = %identity, "Identity blocklisted manually");
    }

    /// Lifts a block and forgets past violations. Returns whether a block was
    /// present.
    pub fn unblock(&self, identity: &str) -> bool {
        self.suspicion.remove(identity);
        let removed = self.blocklist.remove(identity).is_some();
        if removed {
            info!(identity = %identity, "Identity unblocked");
        }
        removed
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        self.active_block(identity, self.clock.now()).is_some()
    }

    /// Current suspicion count of `identity`.
    pub fn violations(&self, identity: &str) -> u32 {
        self.suspicion.get(identity).map(|c| *c).unwrap_or(0)
    }

    pub fn blocked_identities(&self) -> Vec<String> {
        let now = self.clock.now();
        self.blocklist
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drops windows with no request newer than `max_idle`, expired blocks,
    /// and the suspicion of identities left with no window and no block.
    ///
    /// Returns the number of windows removed.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, timestamps| {
            timestamps
                .back()
                .is_some_and(|newest| now.duration_since(*newest) < max_idle)
        });
        let removed = before.saturating_sub(self.windows.len());

        self.blocklist.retain(|_, entry| !entry.is_expired(now));

        let live: HashSet<String> = self
            .windows
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        self.suspicion
            .retain(|identity, _| live.contains(identity) || self.blocklist.contains_key(identity));

        if removed > 0 {
            debug!(removed = removed, remaining = self.windows.len(), "Purged idle rate-limit windows");
        }
        removed
    }

    /// Number of `(identity, endpoint)` windows being tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
