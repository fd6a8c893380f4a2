//! Runtime configuration.
//!
//! [`Config`] gathers the settings of every component. Values come from
//! defaults, then environment variables (`RENDER_*`, `GENERATION_*`), then an
//! optional YAML file with rate-limit tiers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateLimitConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::resources::ResourceConfig;
use crate::scheduler::{RenderQuality, SchedulerConfig};

/// Upper bound of a single render budget.
const MAX_RENDER_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A configuration file is not valid YAML for its schema.
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for a render-forge instance.
#[derive(Debug, Clone)]
pub struct Config {
    // Scheduler settings
    /// Number of render workers.
    pub pool_size: usize,
    /// Time budget of one render.
    pub render_timeout: Duration,
    /// Slots in the job channel.
    pub queue_capacity: usize,
    /// Jobs allowed to wait for a worker before submissions are refused.
    pub max_queue_depth: usize,
    /// Directory rendered files are written to.
    pub output_dir: PathBuf,
    /// Directory submitted scene code is written to.
    pub source_dir: PathBuf,
    /// Renderer command line template; `None` uses the stock manim command.
    pub render_command: Option<String>,
    pub render_quality: RenderQuality,
    /// Public URL prefix rendered files are served under.
    pub public_url_prefix: String,

    // Cleanup settings
    pub cleanup_interval: Duration,
    /// Age after which finished jobs are evicted.
    pub job_max_age: Duration,
    /// Age used instead of `job_max_age` under resource pressure.
    pub emergency_max_age: Duration,
    /// Age after which unfinished jobs are considered abandoned.
    pub stuck_job_age: Duration,
    /// Memory usage percentage that triggers emergency cleanup.
    pub memory_threshold: f64,
    /// CPU usage percentage that triggers emergency cleanup.
    pub cpu_threshold: f64,

    // Rate limiting
    pub rate_limits: RateLimitConfig,

    // Upstream generation settings
    pub generation_api_url: Option<String>,
    pub generation_api_key: Option<String>,
    pub generation_model: String,
    pub generation_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let resources = ResourceConfig::default();
        let retry = RetryPolicy::default();
        let breaker = CircuitBreakerConfig::default();

        Self {
            pool_size: scheduler.pool_size,
            render_timeout: scheduler.render_timeout,
            queue_capacity: scheduler.queue_capacity,
            max_queue_depth: scheduler.max_queue_depth,
            output_dir: scheduler.output_dir,
            source_dir: PathBuf::from("storage/code"),
            render_command: None,
            render_quality: RenderQuality::Low,
            public_url_prefix: "/static/videos".to_string(),

            cleanup_interval: resources.interval,
            job_max_age: resources.normal_age,
            emergency_max_age: resources.emergency_age,
            stuck_job_age: resources.stuck_age,
            memory_threshold: resources.memory_threshold,
            cpu_threshold: resources.cpu_threshold,

            rate_limits: RateLimitConfig::default(),

            generation_api_url: None,
            generation_api_key: None,
            generation_model: "gemini-1.5-flash".to_string(),
            generation_timeout: Duration::from_secs(60),
            breaker_failure_threshold: breaker.failure_threshold,
            breaker_recovery_timeout: breaker.recovery_timeout,
            retry_max_attempts: retry.max_attempts,
            retry_base_delay: retry.base_delay,
            retry_max_delay: retry.max_delay,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RENDER_POOL_SIZE`: Render workers (default: 2)
    /// - `RENDER_TIMEOUT_SECS`: Render timeout in seconds (default: 180)
    /// - `RENDER_QUEUE_CAPACITY`: Job channel slots (default: 64)
    /// - `RENDER_MAX_QUEUE_DEPTH`: Waiting jobs before refusing (default: 100)
    /// - `RENDER_OUTPUT_DIR`: Output directory (default: storage/videos)
    /// - `RENDER_SOURCE_DIR`: Scene code directory (default: storage/code)
    /// - `RENDER_COMMAND`: Renderer command line template
    /// - `RENDER_QUALITY`: `L`, `M` or `H` (default: L)
    /// - `RENDER_PUBLIC_URL_PREFIX`: URL prefix of rendered files (default: /static/videos)
    /// - `RENDER_CLEANUP_INTERVAL_SECS`: Cleanup period (default: 3600)
    /// - `RENDER_JOB_MAX_AGE_HOURS`: Finished job retention (default: 24)
    /// - `RENDER_STUCK_JOB_HOURS`: Abandoned job age, must exceed the retention (default: 72)
    /// - `RENDER_MEMORY_THRESHOLD`: Emergency memory percent (default: 85)
    /// - `RENDER_CPU_THRESHOLD`: Emergency CPU percent (default: 90)
    /// - `RENDER_BLOCK_THRESHOLD`: Denials before blocklisting (default: 10)
    /// - `RENDER_RATE_LIMITS_FILE`: YAML file with rate-limit tiers
    /// - `GENERATION_API_URL`: Upstream generation endpoint
    /// - `GENERATION_API_KEY`: Upstream API key
    /// - `GENERATION_MODEL`: Upstream model (default: gemini-1.5-flash)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// rate-limit file cannot be loaded.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Scheduler settings
        if let Some(val) = lookup("RENDER_POOL_SIZE") {
            config.pool_size = parse_env_value(&val, "RENDER_POOL_SIZE")?;
        }

        if let Some(val) = lookup("RENDER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RENDER_TIMEOUT_SECS")?;
            config.render_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RENDER_QUEUE_CAPACITY") {
            config.queue_capacity = parse_env_value(&val, "RENDER_QUEUE_CAPACITY")?;
        }

        if let Some(val) = lookup("RENDER_MAX_QUEUE_DEPTH") {
            config.max_queue_depth = parse_env_value(&val, "RENDER_MAX_QUEUE_DEPTH")?;
        }

        if let Some(val) = lookup("RENDER_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("RENDER_SOURCE_DIR") {
            config.source_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("RENDER_COMMAND").filter(|v| !v.trim().is_empty()) {
            config.render_command = Some(val);
        }

        if let Some(val) = lookup("RENDER_QUALITY") {
            config.render_quality = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "RENDER_QUALITY".to_string(),
                message,
            })?;
        }

        if let Some(val) = lookup("RENDER_PUBLIC_URL_PREFIX") {
            config.public_url_prefix = val;
        }

        // Cleanup settings
        if let Some(val) = lookup("RENDER_CLEANUP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "RENDER_CLEANUP_INTERVAL_SECS")?;
            config.cleanup_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RENDER_JOB_MAX_AGE_HOURS") {
            config.job_max_age = parse_hours(&val, "RENDER_JOB_MAX_AGE_HOURS")?;
        }

        if let Some(val) = lookup("RENDER_STUCK_JOB_HOURS") {
            config.stuck_job_age = parse_hours(&val, "RENDER_STUCK_JOB_HOURS")?;
        }

        if let Some(val) = lookup("RENDER_MEMORY_THRESHOLD") {
            config.memory_threshold = parse_env_value(&val, "RENDER_MEMORY_THRESHOLD")?;
        }

        if let Some(val) = lookup("RENDER_CPU_THRESHOLD") {
            config.cpu_threshold = parse_env_value(&val, "RENDER_CPU_THRESHOLD")?;
        }

        // Rate limiting
        if let Some(path) = lookup("RENDER_RATE_LIMITS_FILE") {
            config.rate_limits = RateLimitConfig::load(path)?;
        }

        if let Some(val) = lookup("RENDER_BLOCK_THRESHOLD") {
            config.rate_limits.block_threshold = parse_env_value(&val, "RENDER_BLOCK_THRESHOLD")?;
        }

        // Upstream generation
        config.generation_api_url = lookup("GENERATION_API_URL").filter(|v| !v.is_empty());
        config.generation_api_key = lookup("GENERATION_API_KEY").filter(|v| !v.is_empty());

        if let Some(val) = lookup("GENERATION_MODEL") {
            config.generation_model = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if self.render_timeout.is_zero() || self.render_timeout > MAX_RENDER_TIMEOUT {
            return Err(ConfigError::ValidationFailed(format!(
                "render_timeout must be within (0, {}s]",
                MAX_RENDER_TIMEOUT.as_secs()
            )));
        }

        if self.queue_capacity == 0 || self.max_queue_depth == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_capacity and max_queue_depth must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        if self.emergency_max_age > self.job_max_age {
            return Err(ConfigError::ValidationFailed(
                "emergency_max_age cannot exceed job_max_age".to_string(),
            ));
        }

        // Queued work may legitimately wait longer than the emergency age.
        if self.stuck_job_age <= self.job_max_age {
            return Err(ConfigError::ValidationFailed(
                "stuck_job_age must be greater than job_max_age".to_string(),
            ));
        }

        for (name, value) in [
            ("memory_threshold", self.memory_threshold),
            ("cpu_threshold", self.cpu_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) || value == 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be within (0, 100]"
                )));
            }
        }

        if self.retry_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_max_attempts must be greater than 0".to_string(),
            ));
        }

        self.rate_limits.validate()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.pool_size)
            .with_queue_capacity(self.queue_capacity)
            .with_max_queue_depth(self.max_queue_depth)
            .with_render_timeout(self.render_timeout)
            .with_output_dir(self.output_dir.clone())
    }

    pub fn resource_config(&self) -> ResourceConfig {
        ResourceConfig {
            interval: self.cleanup_interval,
            normal_age: self.job_max_age,
            emergency_age: self.emergency_max_age,
            stuck_age: self.stuck_job_age,
            memory_threshold: self.memory_threshold,
            cpu_threshold: self.cpu_threshold,
            rate_limit_idle: self.rate_limits.longest_window(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts)
            .with_base_delay(self.retry_base_delay)
            .with_max_delay(self.retry_max_delay)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(self.breaker_failure_threshold, self.breaker_recovery_timeout)
    }
}

/// Parse a whole number of hours.
fn parse_hours(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let hours: u64 = parse_env_value(value, key)?;
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{hours} hours is out of range"),
        })
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.render_timeout, Duration::from_secs(180));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.job_max_age, Duration::from_secs(24 * 3600));
        assert_eq!(config.stuck_job_age, Duration::from_secs(72 * 3600));
        assert!(config.stuck_job_age > config.job_max_age);
        assert!((config.memory_threshold - 85.0).abs() < f64::EPSILON);
        assert!((config.cpu_threshold - 90.0).abs() < f64::EPSILON);
        assert_eq!(config.public_url_prefix, "/static/videos");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("RENDER_POOL_SIZE", "4"),
            ("RENDER_TIMEOUT_SECS", "60"),
            ("RENDER_QUALITY", "H"),
            ("RENDER_JOB_MAX_AGE_HOURS", "48"),
            ("RENDER_BLOCK_THRESHOLD", "3"),
            ("GENERATION_API_KEY", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.pool_size, 4);
        assert_eq!(config.render_timeout, Duration::from_secs(60));
        assert_eq!(config.render_quality, RenderQuality::High);
        assert_eq!(config.job_max_age, Duration::from_secs(48 * 3600));
        assert_eq!(config.rate_limits.block_threshold, 3);
        assert_eq!(config.generation_api_key.as_deref(), Some("secret"));
        assert!(config.generation_api_url.is_none());
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = Config::from_lookup(lookup_from(&[("RENDER_POOL_SIZE", "many")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "RENDER_POOL_SIZE"),
            other => panic!("unexpected error: {other}"),
        }

        let err = Config::from_lookup(lookup_from(&[("RENDER_QUALITY", "ultra")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let err = Config::from_lookup(lookup_from(&[("RENDER_POOL_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let config = Config {
            memory_threshold: 120.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_stuck_age_within_retention() {
        let err = Config::from_lookup(lookup_from(&[
            ("RENDER_JOB_MAX_AGE_HOURS", "24"),
            ("RENDER_STUCK_JOB_HOURS", "2"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));

        let config = Config {
            stuck_job_age: Config::default().job_max_age,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let err = Config::from_lookup(lookup_from(&[(
            "RENDER_STUCK_JOB_HOURS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "RENDER_STUCK_JOB_HOURS"),
            other => panic!("unexpected error: {other}"),
        }

        let err = Config::from_lookup(lookup_from(&[(
            "RENDER_TIMEOUT_SECS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_rate_limits_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(&path, "default_limit: { max_requests: 7, window_secs: 70 }\n").unwrap();

        let config = Config::from_lookup(lookup_from(&[(
            "RENDER_RATE_LIMITS_FILE",
            path.to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(config.rate_limits.default_limit.max_requests, 7);
    }

    #[test]
    fn test_derived_component_configs() {
        let config = Config::default();

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.pool_size, config.pool_size);
        assert_eq!(scheduler.render_timeout, config.render_timeout);

        let resources = config.resource_config();
        assert_eq!(resources.normal_age, config.job_max_age);
        assert_eq!(resources.rate_limit_idle, Duration::from_secs(600));

        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.breaker_config().failure_threshold, 5);
    }
}
