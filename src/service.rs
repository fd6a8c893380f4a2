//! Caller-facing facade over the render engine.
//!
//! [`RenderService`] wires the registry, scheduler, rate limiter, resource
//! manager and generation client together and exposes the operations a
//! transport layer needs: submit, poll, inspect, health and manual cleanup.
//! Every error is a [`ServiceError`] carrying its HTTP status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ServiceError;
use crate::generation::{GuardedGenerator, HttpGenerationService};
use crate::ratelimit::{Decision, RateLimiter};
use crate::registry::{Job, JobId, JobRegistry, JobStatus, RegistryMetrics};
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::resources::{
    CleanupReport, FileStore, LocalFileStore, ProcProbe, ResourceManager, ResourceProbe,
};
use crate::scheduler::{
    extract_scene_class, PoolStats, ProcessRenderer, RenderScheduler, Renderer, SchedulerError,
};

/// Endpoint name submissions are rate limited under.
pub const RENDER_ENDPOINT: &str = "/api/render";

/// Rendering time after which a job is reported as a health issue.
const SLOW_RENDER_THRESHOLD: Duration = Duration::from_secs(300);

/// Error percentage above which the service reports itself degraded.
const ERROR_RATE_THRESHOLD: f64 = 50.0;

const MIN_CLEANUP_HOURS: u64 = 1;
const MAX_CLEANUP_HOURS: u64 = 168;

/// Longest file stem kept from a caller-supplied name.
const MAX_SOURCE_STEM: usize = 50;

/// Reply to an accepted submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Pollable view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct RenderStatus {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Public URL of the output, once `ready`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Detailed view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetails {
    #[serde(flatten)]
    pub status: RenderStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based position among queued jobs.
    pub queue_position: Option<usize>,
    pub estimated_wait_secs: Option<f64>,
    pub processing_time_secs: Option<f64>,
    pub render_time_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Health summary of the running service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub jobs: RegistryMetrics,
    pub pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitState>,
    pub blocked_identities: usize,
}

/// Recommended client polling cadence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollingStrategy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    /// Attempts between two interval increases.
    pub backoff_every: u32,
    pub max_attempts: u32,
}

impl Default for PollingStrategy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            backoff_every: 5,
            max_attempts: 180,
        }
    }
}

impl PollingStrategy {
    /// Interval to wait before poll number `attempt` (0-based), or `None`
    /// once the client should give up.
    pub fn interval_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let steps = attempt / self.backoff_every.max(1);
        let factor = self.backoff_multiplier.powi(steps.min(64) as i32);
        let secs = self.initial_interval.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64())))
    }
}

/// The render engine behind one facade.
pub struct RenderService {
    registry: Arc<JobRegistry>,
    scheduler: RenderScheduler,
    limiter: Arc<RateLimiter>,
    resources: Arc<ResourceManager>,
    outputs: Arc<dyn FileStore>,
    sources: Arc<dyn FileStore>,
    generator: Option<GuardedGenerator>,
}

impl RenderService {
    /// Assembles a service around the given renderer and resource probe.
    pub fn new(
        config: &Config,
        renderer: Arc<dyn Renderer>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let outputs: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(
            config.output_dir.clone(),
            config.public_url_prefix.clone(),
        ));
        let sources: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(
            config.source_dir.clone(),
            config.public_url_prefix.clone(),
        ));

        let scheduler =
            RenderScheduler::new(config.scheduler_config(), registry.clone(), renderer);
        let resources = Arc::new(
            ResourceManager::new(
                config.resource_config(),
                registry.clone(),
                outputs.clone(),
                probe,
            )
            .with_rate_limiter(limiter.clone())
            .with_source_store(sources.clone()),
        );

        Self {
            registry,
            scheduler,
            limiter,
            resources,
            outputs,
            sources,
            generator: None,
        }
    }

    /// Builds the production service: process renderer, `/proc` probe and,
    /// when an endpoint is configured, the HTTP generation client.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Validation` for an unusable render command and
    /// `ServiceError::Upstream` if the generation client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let renderer = match config.render_command.as_deref() {
            Some(command) => ProcessRenderer::from_command_line(command).ok_or_else(|| {
                ServiceError::Validation("render command is empty".to_string())
            })?,
            None => ProcessRenderer::manim(),
        }
        .with_quality(config.render_quality);

        let mut service = Self::new(config, Arc::new(renderer), Arc::new(ProcProbe::new()));

        if let Some(http) = HttpGenerationService::from_config(config)? {
            info!(endpoint = %http.endpoint(), model = %http.model(), "Generation client configured");
            let breaker = Arc::new(CircuitBreaker::new("generation", config.breaker_config()));
            service = service.with_generator(GuardedGenerator::new(
                Arc::new(http),
                breaker,
                config.retry_policy(),
            ));
        }

        Ok(service)
    }

    pub fn with_generator(mut self, generator: GuardedGenerator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Starts the render workers and the periodic cleanup task.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Unavailable` if either cannot be started.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        self.resources
            .start()
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        info!("Render service started");
        Ok(())
    }

    /// Stops the cleanup task and drains the render workers.
    pub async fn shutdown(&self) {
        if let Err(e) = self.resources.stop().await {
            warn!(error = %e, "Resource manager stop failed");
        }
        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "Scheduler shutdown failed");
        }
        info!("Render service stopped");
    }

    /// Submits a source file that already exists on disk.
    ///
    /// # Errors
    ///
    /// - `RateLimited` if `identity` is over its limit or blocked
    /// - `QueueFull` if the render queue is at capacity
    pub fn submit_render(
        &self,
        identity: &str,
        source_file: impl Into<PathBuf>,
    ) -> Result<SubmitResponse, ServiceError> {
        self.admit(identity, RENDER_ENDPOINT)?;
        self.enqueue(source_file.into())
    }

    /// Stores submitted scene code and queues it for rendering.
    ///
    /// # Errors
    ///
    /// - `RateLimited` if `identity` is over its limit or blocked
    /// - `Validation` if the code defines no scene class
    /// - `QueueFull` if the render queue is at capacity
    /// - `Internal` if the code cannot be written
    pub async fn submit_code(
        &self,
        identity: &str,
        name: &str,
        code: &str,
    ) -> Result<SubmitResponse, ServiceError> {
        self.admit(identity, RENDER_ENDPOINT)?;

        if code.trim().is_empty() {
            return Err(ServiceError::Validation("code cannot be empty".to_string()));
        }
        if extract_scene_class(code).is_none() {
            return Err(ServiceError::Validation(
                "code does not define a scene class".to_string(),
            ));
        }

        let file_name = source_file_name(name);
        let stored = self
            .sources
            .save(&file_name, code.as_bytes())
            .await
            .map_err(|e| ServiceError::Internal(format!("failed to store code: {e}")))?;

        let result = self.enqueue(stored.path.clone());
        if result.is_err() {
            let location = stored.path.to_string_lossy();
            if let Err(e) = self.sources.delete(&location).await {
                warn!(source = %location, error = %e, "Failed to delete refused source");
            }
        }
        result
    }

    /// Runs `prompt` through the guarded generation client.
    ///
    /// # Errors
    ///
    /// - `RateLimited` if `identity` is over its limit for `endpoint`
    /// - `Unavailable` if no generation client is configured
    /// - `CircuitOpen`, `Upstream` or `Validation` from the upstream call
    pub async fn generate(
        &self,
        identity: &str,
        endpoint: &str,
        prompt: &str,
    ) -> Result<String, ServiceError> {
        self.admit(identity, endpoint)?;
        let generator = self.generator.as_ref().ok_or_else(|| {
            ServiceError::Unavailable("generation service is not configured".to_string())
        })?;
        Ok(generator.generate(prompt).await?)
    }

    /// Current status of a job.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotFound` for unknown or evicted ids.
    pub fn poll_render(&self, job_id: JobId) -> Result<RenderStatus, ServiceError> {
        let job = self.job(job_id)?;
        Ok(self.render_status(&job))
    }

    /// Status plus timing and queue information.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotFound` for unknown or evicted ids.
    pub fn job_details(&self, job_id: JobId) -> Result<JobDetails, ServiceError> {
        let job = self.job(job_id)?;
        let (queue_position, estimated_wait_secs) = if job.status == JobStatus::Queued {
            (
                self.registry.queue_position(job_id),
                self.registry
                    .estimated_wait(job_id)
                    .map(|wait| wait.as_secs_f64()),
            )
        } else {
            (None, None)
        };

        Ok(JobDetails {
            status: self.render_status(&job),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            queue_position,
            estimated_wait_secs,
            processing_time_secs: job.processing_time().map(chrono_secs),
            render_time_secs: job.render_time().map(chrono_secs),
        })
    }

    /// Reports whether the service is healthy and why not.
    pub fn health(&self) -> HealthReport {
        let jobs = self.registry.metrics();
        let mut issues = Vec::new();

        if jobs.error_rate > ERROR_RATE_THRESHOLD {
            issues.push(format!("High error rate: {:.1}%", jobs.error_rate));
        }

        let slow = self
            .registry
            .list(Some(JobStatus::Rendering))
            .iter()
            .filter(|job| {
                job.render_time()
                    .and_then(|t| t.to_std().ok())
                    .is_some_and(|t| t > SLOW_RENDER_THRESHOLD)
            })
            .count();
        if slow > 0 {
            issues.push(format!("{slow} jobs stuck in rendering state"));
        }

        let circuit = self.generator.as_ref().map(|g| g.breaker().state());
        if circuit == Some(CircuitState::Open) {
            issues.push("Generation circuit is open".to_string());
        }

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            issues,
            jobs,
            pool: self.scheduler.stats(),
            circuit,
            blocked_identities: self.limiter.blocked_identities().len(),
        }
    }

    pub fn polling_strategy(&self) -> PollingStrategy {
        PollingStrategy::default()
    }

    /// Runs one cleanup pass now, with the age clamped to 1..=168 hours.
    pub async fn cleanup_now(&self, max_age_hours: u64) -> CleanupReport {
        let hours = max_age_hours.clamp(MIN_CLEANUP_HOURS, MAX_CLEANUP_HOURS);
        info!(max_age_hours = hours, "Manual cleanup requested");
        self.resources
            .cleanup_older_than(Duration::from_secs(hours * 3600))
            .await
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    fn admit(&self, identity: &str, endpoint: &str) -> Result<(), ServiceError> {
        match self.limiter.check(identity, endpoint) {
            Decision::Allowed => Ok(()),
            Decision::Denied(reason) => Err(ServiceError::RateLimited {
                message: reason.to_string(),
                retry_after: reason.retry_after(),
            }),
        }
    }

    fn enqueue(&self, source_file: PathBuf) -> Result<SubmitResponse, ServiceError> {
        let job_id = self.scheduler.submit(source_file).map_err(|e| match e {
            SchedulerError::QueueFull { .. } => ServiceError::QueueFull,
            closed @ SchedulerError::QueueClosed => ServiceError::Unavailable(closed.to_string()),
            other => ServiceError::Internal(other.to_string()),
        })?;

        Ok(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
        })
    }

    fn job(&self, job_id: JobId) -> Result<Job, ServiceError> {
        self.registry
            .get(job_id)
            .map_err(|_| ServiceError::NotFound(job_id))
    }

    fn render_status(&self, job: &Job) -> RenderStatus {
        RenderStatus {
            job_id: job.id,
            status: job.status,
            output_url: job
                .output_location
                .as_deref()
                .map(|location| self.outputs.public_url(location)),
            error_message: job.error_message.clone(),
        }
    }
}

fn chrono_secs(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

/// `<stem>_<timestamp>_<short id>.py` with the stem reduced to safe characters.
fn source_file_name(name: &str) -> String {
    let base = name.trim();
    let base = base.strip_suffix(".py").unwrap_or(base);
    let stem: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_SOURCE_STEM)
        .collect();
    let stem = if stem.is_empty() { "scene".to_string() } else { stem };
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let short_id = &Uuid::new_v4().simple().to_string()[..8];
    format!("{stem}_{timestamp}_{short_id}.py")
}
