//! Rate-limit tiers.
//!
//! Limits are keyed by endpoint path. Endpoints without an explicit entry use
//! `default_limit`. Tiers can be loaded from YAML:
//!
//! ```yaml
//! default_limit: { max_requests: 10, window_secs: 300 }
//! block_threshold: 10
//! block_duration_secs: 3600
//! endpoints:
//!   /api/render: { max_requests: 2, window_secs: 600 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Requests allowed per trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl EndpointLimit {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Limits for every endpoint plus blocklist escalation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub endpoints: BTreeMap<String, EndpointLimit>,
    pub default_limit: EndpointLimit,
    /// Denials after which an identity is blocklisted.
    pub block_threshold: u32,
    /// How long a block lasts; `None` keeps it until cleared.
    pub block_duration_secs: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let endpoints = [
            ("/api/lesson", EndpointLimit::new(5, 300)),
            ("/api/example", EndpointLimit::new(5, 300)),
            ("/api/manim", EndpointLimit::new(3, 300)),
            ("/api/render", EndpointLimit::new(2, 600)),
        ]
        .into_iter()
        .map(|(path, limit)| (path.to_string(), limit))
        .collect();

        Self {
            endpoints,
            default_limit: EndpointLimit::new(10, 300),
            block_threshold: 10,
            block_duration_secs: None,
        }
    }
}

impl RateLimitConfig {
    /// Parses tiers from YAML. Missing fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads tiers from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, limit: EndpointLimit) -> Self {
        self.endpoints.insert(endpoint.into(), limit);
        self
    }

    pub fn with_default_limit(mut self, limit: EndpointLimit) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_block_threshold(mut self, threshold: u32) -> Self {
        self.block_threshold = threshold;
        self
    }

    pub fn with_block_duration(mut self, duration: Option<Duration>) -> Self {
        self.block_duration_secs = duration.map(|d| d.as_secs());
        self
    }

    /// Limit that applies to `endpoint`.
    pub fn limit_for(&self, endpoint: &str) -> EndpointLimit {
        self.endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration_secs.map(Duration::from_secs)
    }

    /// Longest window across all tiers.
    pub fn longest_window(&self) -> Duration {
        self.endpoints
            .values()
            .chain(std::iter::once(&self.default_limit))
            .map(EndpointLimit::window)
            .max()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (endpoint, limit) in self
            .endpoints
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(std::iter::once(("default", &self.default_limit)))
        {
            if limit.max_requests == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "rate limit for {endpoint} must allow at least one request"
                )));
            }
            if limit.window_secs == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "rate limit window for {endpoint} must be greater than 0"
                )));
            }
        }

        if self.block_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "block_threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
