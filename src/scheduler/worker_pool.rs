//! Worker pool that executes render jobs.
//!
//! The [`RenderScheduler`] accepts jobs, queues their ids and runs a fixed
//! number of workers. Each worker pulls an id from the shared queue, moves the
//! job to `rendering`, invokes the [`Renderer`] under a timeout and records the
//! outcome back in the registry.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Queue-depth ceiling checked before a job is created
//! - Graceful shutdown with broadcast channel
//! - Panics while processing a job are contained and turned into failed jobs
//! - Pool statistics tracking

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, RenderError};
use crate::metrics::MetricsCollector;
use crate::registry::{Job, JobId, JobRegistry, JobStatus, Transition};

use super::queue::{QueueError, WorkQueue};
use super::renderer::Renderer;

/// Message stored when a render exceeds its time budget.
pub const RENDER_TIMEOUT_MESSAGE: &str = "render timeout";

/// Message stored when the renderer panicked.
pub const INTERNAL_FAILURE_MESSAGE: &str = "internal render failure";

/// Errors that can occur in the render scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The queue-depth ceiling has been reached.
    #[error("Render queue is full ({depth} jobs waiting)")]
    QueueFull { depth: usize },

    /// The queue can no longer accept jobs.
    #[error("Render queue is closed")]
    QueueClosed,

    /// Scheduler is already running.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running.
    #[error("Scheduler is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The output directory could not be prepared.
    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<QueueError> for SchedulerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { depth } => SchedulerError::QueueFull { depth },
            QueueError::Closed => SchedulerError::QueueClosed,
        }
    }
}

/// Configuration for the render scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks to spawn.
    pub pool_size: usize,
    /// Slots in the job channel.
    pub queue_capacity: usize,
    /// Jobs that may wait for a worker before submissions are refused.
    pub max_queue_depth: usize,
    /// Time budget handed to the renderer.
    pub render_timeout: Duration,
    /// Extra time allowed for the renderer to tear down after its budget.
    pub kill_grace: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Directory rendered files are written to.
    pub output_dir: PathBuf,
    /// Extension of rendered files.
    pub output_extension: String,
    /// Longest failure message stored on a job, in characters.
    pub max_error_len: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            queue_capacity: 64,
            max_queue_depth: 100,
            render_timeout: Duration::from_secs(180),
            kill_grace: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            output_dir: PathBuf::from("storage/videos"),
            output_extension: "mp4".to_string(),
            max_error_len: 500,
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_max_error_len(mut self, len: usize) -> Self {
        self.max_error_len = len;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently rendering.
    pub active_workers: usize,
    /// Jobs that finished `ready`.
    pub jobs_completed: u64,
    /// Jobs that finished `error` for reasons other than a timeout.
    pub jobs_failed: u64,
    /// Jobs that hit the render timeout.
    pub jobs_timed_out: u64,
    /// Average render duration.
    pub average_job_duration: Duration,
    /// Jobs waiting for a worker.
    pub queue_depth: usize,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_timed_out
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// How a render attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderOutcome {
    Ready,
    Failed,
    TimedOut,
}

impl RenderOutcome {
    fn label(&self) -> &'static str {
        match self {
            RenderOutcome::Ready => "ready",
            RenderOutcome::Failed => "error",
            RenderOutcome::TimedOut => "timeout",
        }
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_timed_out: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_timed_out: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: RenderOutcome, duration: Duration) {
        let counter = match outcome {
            RenderOutcome::Ready => &self.jobs_completed,
            RenderOutcome::Failed => &self.jobs_failed,
            RenderOutcome::TimedOut => &self.jobs_timed_out,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    fn to_pool_stats(&self, num_workers: usize, queue_depth: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let timed_out = self.jobs_timed_out.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + failed + timed_out;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_timed_out: timed_out,
            average_job_duration: average_duration,
            queue_depth,
        }
    }
}

/// Counts a worker as active until dropped.
struct ActiveGuard<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> ActiveGuard<'a> {
    fn enter(ctx: &'a WorkerContext) -> Self {
        let active = ctx.stats.increment_active();
        ctx.metrics.update_active_workers(active as usize);
        Self { ctx }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let active = self.ctx.stats.decrement_active();
        self.ctx.metrics.update_active_workers(active as usize);
    }
}

/// State shared by the scheduler and its workers.
struct WorkerContext {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    renderer: Arc<dyn Renderer>,
    queue: WorkQueue,
    stats: SharedPoolStats,
    metrics: MetricsCollector,
}

/// Accepts render jobs and runs them on a fixed pool of workers.
pub struct RenderScheduler {
    ctx: Arc<WorkerContext>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl RenderScheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<JobRegistry>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let queue = WorkQueue::new(config.queue_capacity, config.max_queue_depth);
        // Only one shutdown message is ever sent.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            ctx: Arc::new(WorkerContext {
                config,
                registry,
                renderer,
                queue,
                stats: SharedPoolStats::new(),
                metrics: MetricsCollector::new(),
            }),
            shutdown_tx,
            worker_handles: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Creates a `queued` job for `source_file` and enqueues it.
    ///
    /// Returns as soon as the job is recorded; a full channel only delays
    /// the start of rendering. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::QueueFull` without creating a job when the
    /// queue-depth ceiling is reached.
    pub fn submit(&self, source_file: impl Into<PathBuf>) -> Result<JobId, SchedulerError> {
        self.ctx.queue.reserve()?;
        let id = self.ctx.registry.create(source_file);
        self.enqueue_reserved(id)?;
        Ok(id)
    }

    /// Enqueues a job that was created directly in the registry.
    ///
    /// # Errors
    ///
    /// - `Registry(NotFound)` if the job does not exist
    /// - `Registry(InvalidTransition)` if the job is no longer queued
    /// - `QueueFull` if the queue-depth ceiling is reached
    pub fn submit_existing(&self, id: JobId) -> Result<(), SchedulerError> {
        let job = self.ctx.registry.get(id)?;
        if job.status != JobStatus::Queued {
            return Err(RegistryError::InvalidTransition {
                from: job.status,
                to: JobStatus::Rendering,
            }
            .into());
        }
        self.ctx.queue.reserve()?;
        self.enqueue_reserved(id)
    }

    fn enqueue_reserved(&self, id: JobId) -> Result<(), SchedulerError> {
        if let Err(e) = self.ctx.queue.push(id) {
            error!(job_id = %id, error = %e, "Failed to enqueue job");
            if let Err(fail_err) = self
                .ctx
                .registry
                .transition(id, Transition::fail("render queue unavailable"))
            {
                warn!(job_id = %id, error = %fail_err, "Could not fail unqueued job");
            }
            return Err(e.into());
        }
        let depth = self.ctx.queue.depth();
        self.ctx.metrics.update_queue_depth(depth);
        debug!(job_id = %id, queue_depth = depth, "Job enqueued");
        Ok(())
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if the pool is already running
    /// - `OutputDir` if the output directory cannot be created
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let output_dir = &self.ctx.config.output_dir;
        if let Err(source) = tokio::fs::create_dir_all(output_dir).await {
            self.is_running.store(false, Ordering::SeqCst);
            return Err(SchedulerError::OutputDir {
                path: output_dir.clone(),
                source,
            });
        }

        let mut handles = self.lock_handles();
        for i in 0..self.ctx.config.pool_size {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.ctx),
                self.shutdown_tx.subscribe(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        info!(
            num_workers = self.ctx.config.pool_size,
            renderer = self.ctx.renderer.name(),
            output_dir = %output_dir.display(),
            "Render scheduler started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the job they are rendering before stopping. Queued jobs
    /// stay queued.
    ///
    /// # Errors
    ///
    /// - `NotRunning` if the pool was not started
    /// - `ShutdownTimeout` if workers don't stop within the configured
    ///   timeout; the remaining workers are aborted
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating render scheduler shutdown");

        // Workers may have already stopped.
        let _ = self.shutdown_tx.send(());

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_handles());
        let shutdown_timeout = self.ctx.config.shutdown_timeout;
        let shutdown_future = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Render scheduler shutdown complete");
                Ok(())
            }
            Err(_) => {
                for handle in &handles {
                    handle.abort();
                }
                Err(SchedulerError::ShutdownTimeout(shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.ctx
            .stats
            .to_pool_stats(self.ctx.config.pool_size, self.ctx.queue.depth())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.ctx.queue.depth()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.ctx.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.ctx.config
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.worker_handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        for handle in self.lock_handles().iter() {
            handle.abort();
        }
    }
}

/// A single worker that renders jobs from the queue.
pub struct Worker {
    id: String,
    ctx: Arc<WorkerContext>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    fn new(id: String, ctx: Arc<WorkerContext>, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            id,
            ctx,
            shutdown_rx,
        }
    }

    /// Main worker loop.
    ///
    /// Waits for job ids and renders them until a shutdown signal is received
    /// or the queue closes.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                next = self.ctx.queue.pop() => next,
            };

            match next {
                Some(job_id) => {
                    self.ctx.metrics.update_queue_depth(self.ctx.queue.depth());
                    if let Err(panic) = AssertUnwindSafe(self.process_job(job_id))
                        .catch_unwind()
                        .await
                    {
                        error!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            panic = %panic_message(panic.as_ref()),
                            "Worker panicked while processing job, recovering"
                        );
                        self.fail_after_panic(job_id);
                    }
                }
                None => {
                    warn!(worker_id = %self.id, "Queue closed");
                    break;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Renders a single job and records its terminal state.
    async fn process_job(&self, job_id: JobId) {
        let job = match self.ctx.registry.transition(job_id, Transition::Start) {
            Ok(job) => job,
            Err(RegistryError::NotFound(_)) => {
                warn!(worker_id = %self.id, job_id = %job_id, "Job evicted before it started, skipping");
                return;
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Job could not be started, skipping");
                return;
            }
        };

        let active = ActiveGuard::enter(&self.ctx);

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            source = %job.source_file.display(),
            "Rendering job"
        );

        let start_time = Instant::now();
        let (transition, outcome) = self.execute_with_timeout(&job).await;
        let duration = start_time.elapsed();

        drop(active);
        self.ctx.stats.record(outcome, duration);
        self.ctx
            .metrics
            .record_render(outcome.label(), duration.as_secs_f64());

        match self.ctx.registry.transition(job_id, transition) {
            Ok(job) => match outcome {
                RenderOutcome::Ready => info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Job rendered successfully"
                ),
                _ => warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    outcome = outcome.label(),
                    error = ?job.error_message,
                    "Job failed"
                ),
            },
            Err(RegistryError::NotFound(_)) => {
                warn!(worker_id = %self.id, job_id = %job_id, "Job evicted while rendering");
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to record render outcome");
            }
        }
    }

    /// Fails a job whose processing panicked, unless it already finished.
    fn fail_after_panic(&self, job_id: JobId) {
        match self
            .ctx
            .registry
            .transition(job_id, Transition::fail(INTERNAL_FAILURE_MESSAGE))
        {
            Ok(_) => self.ctx.metrics.record_render(RenderOutcome::Failed.label(), 0.0),
            Err(RegistryError::InvalidTransition { .. } | RegistryError::NotFound(_)) => {}
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to record panicked job");
            }
        }
    }

    /// Runs the renderer, converting every way it can end into a transition.
    async fn execute_with_timeout(&self, job: &Job) -> (Transition, RenderOutcome) {
        let config = &self.ctx.config;
        let output = output_path_for(job, &config.output_dir, &config.output_extension);
        let render = self
            .ctx
            .renderer
            .render(&job.source_file, &output, config.render_timeout);

        // The renderer enforces its own budget; this outer bound only catches
        // renderers that ignore it.
        let deadline = config.render_timeout.saturating_add(config.kill_grace);
        match tokio::time::timeout(deadline, AssertUnwindSafe(render).catch_unwind()).await {
            Ok(Ok(Ok(path))) => (
                Transition::complete(path.to_string_lossy()),
                RenderOutcome::Ready,
            ),
            Ok(Ok(Err(RenderError::Timeout(_)))) | Err(_) => (
                Transition::fail(RENDER_TIMEOUT_MESSAGE),
                RenderOutcome::TimedOut,
            ),
            Ok(Ok(Err(e))) => (
                Transition::fail(sanitize_error_message(&e.to_string(), config.max_error_len)),
                RenderOutcome::Failed,
            ),
            Ok(Err(panic)) => {
                let detail = panic_message(panic.as_ref());
                error!(worker_id = %self.id, job_id = %job.id, panic = %detail, "Renderer panicked");
                (
                    Transition::fail(INTERNAL_FAILURE_MESSAGE),
                    RenderOutcome::Failed,
                )
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_default()
}

/// Builds `<output_dir>/<stem>_<timestamp>_<short id>.<ext>` for a job.
fn output_path_for(job: &Job, output_dir: &Path, extension: &str) -> PathBuf {
    let stem = job
        .source_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "render".to_string());
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let short_id = &job.id.simple().to_string()[..8];
    output_dir.join(format!("{stem}_{timestamp}_{short_id}.{extension}"))
}

fn absolute_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(^|[\s'"(=:])(?:/[^\s/'"]+)*/([^\s/'"]+)"#)
            .expect("absolute path pattern is valid")
    })
}

/// Prepares a renderer message for callers: absolute paths are reduced to
/// their file name and the text is cut to `max_len` characters.
pub fn sanitize_error_message(message: &str, max_len: usize) -> String {
    let stripped = absolute_path_pattern().replace_all(message.trim(), "${1}${2}");
    if stripped.chars().count() <= max_len {
        return stripped.into_owned();
    }
    let mut truncated: String = stripped.chars().take(max_len.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Renderer that sleeps and then writes or fails on request.
    struct FakeRenderer {
        delay: Duration,
        fail_with: Option<String>,
        panic: bool,
        calls: AtomicUsize,
    }

    impl FakeRenderer {
        fn ok(delay: Duration) -> Self {
            Self {
                delay,
                fail_with: None,
                panic: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(
            &self,
            _source: &Path,
            output: &Path,
            timeout: Duration,
        ) -> Result<PathBuf, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("renderer exploded");
            }
            if self.delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(RenderError::Timeout(timeout));
            }
            tokio::time::sleep(self.delay).await;
            match &self.fail_with {
                Some(msg) => Err(RenderError::Failed {
                    code: Some(1),
                    output: msg.clone(),
                }),
                None => Ok(output.to_path_buf()),
            }
        }
    }

    /// Renderer that never returns.
    struct HangingRenderer;

    #[async_trait]
    impl Renderer for HangingRenderer {
        async fn render(&self, _: &Path, _: &Path, _: Duration) -> Result<PathBuf, RenderError> {
            std::future::pending().await
        }
    }

    fn scheduler_with(renderer: impl Renderer + 'static, config: SchedulerConfig) -> RenderScheduler {
        let dir = std::env::temp_dir().join("render-forge-scheduler-tests");
        RenderScheduler::new(
            config.with_output_dir(dir),
            Arc::new(JobRegistry::new()),
            Arc::new(renderer),
        )
    }

    async fn wait_terminal(scheduler: &RenderScheduler, id: JobId) -> Job {
        for _ in 0..1000 {
            let job = scheduler.registry().get(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();

        assert_eq!(config.pool_size, 2);
        assert_eq!(config.render_timeout, Duration::from_secs(180));
        assert_eq!(config.max_error_len, 500);
        assert_eq!(config.output_extension, "mp4");
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::new(8)
            .with_queue_capacity(4)
            .with_max_queue_depth(16)
            .with_render_timeout(Duration::from_secs(60))
            .with_kill_grace(Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_secs(120))
            .with_output_dir("/srv/videos")
            .with_max_error_len(80);

        assert_eq!(config.pool_size, 8);
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.max_queue_depth, 16);
        assert_eq!(config.render_timeout, Duration::from_secs(60));
        assert_eq!(config.kill_grace, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.output_dir, PathBuf::from("/srv/videos"));
        assert_eq!(config.max_error_len, 80);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 15,
            jobs_timed_out: 5,
            average_job_duration: Duration::from_secs(60),
            queue_depth: 0,
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(RenderOutcome::Ready, Duration::from_secs(10));
        stats.record(RenderOutcome::Ready, Duration::from_secs(20));
        stats.record(RenderOutcome::TimedOut, Duration::from_secs(5));
        assert_eq!(stats.increment_active(), 1);
        assert_eq!(stats.decrement_active(), 0);

        let pool_stats = stats.to_pool_stats(4, 3);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_timed_out, 1);
        assert_eq!(pool_stats.queue_depth, 3);
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_sanitize_error_message() {
        let msg = "Renderer exited with code Some(1): File /home/app/storage/code/intro.py, line 3";
        let cleaned = sanitize_error_message(msg, 500);
        assert!(!cleaned.contains("/home/app"));
        assert!(cleaned.contains("intro.py"));

        let long = "x".repeat(600);
        let cleaned = sanitize_error_message(&long, 500);
        assert_eq!(cleaned.chars().count(), 500);
        assert!(cleaned.ends_with('…'));

        assert_eq!(sanitize_error_message("and/or", 500), "and/or");
    }

    #[test]
    fn test_output_path_for() {
        let job = Job::new("/tmp/code/intro.py");
        let path = output_path_for(&job, Path::new("/videos"), "mp4");
        let name = path.file_name().unwrap().to_string_lossy();

        assert!(path.starts_with("/videos"));
        assert!(name.starts_with("intro_"));
        assert!(name.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_scheduler_renders_job() {
        let scheduler = scheduler_with(FakeRenderer::ok(Duration::from_millis(10)), SchedulerConfig::default());
        scheduler.start().await.unwrap();

        let id = scheduler.submit("scene.py").unwrap();
        let job = wait_terminal(&scheduler, id).await;

        assert_eq!(job.status, JobStatus::Ready);
        assert!(job.output_location.unwrap().ends_with(".mp4"));
        assert!(job.error_message.is_none());
        assert_eq!(scheduler.stats().jobs_completed, 1);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_records_failure() {
        let renderer = FakeRenderer {
            fail_with: Some("NameError at /srv/code/scene.py".to_string()),
            ..FakeRenderer::ok(Duration::ZERO)
        };
        let scheduler = scheduler_with(renderer, SchedulerConfig::default());
        scheduler.start().await.unwrap();

        let id = scheduler.submit("scene.py").unwrap();
        let job = wait_terminal(&scheduler, id).await;

        assert_eq!(job.status, JobStatus::Error);
        let message = job.error_message.unwrap();
        assert!(message.contains("NameError"));
        assert!(!message.contains("/srv/code"));
        assert!(job.output_location.is_none());

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_render_timeout() {
        let config = SchedulerConfig::default().with_render_timeout(Duration::from_millis(50));
        let scheduler = scheduler_with(FakeRenderer::ok(Duration::from_secs(60)), config);
        scheduler.start().await.unwrap();

        let id = scheduler.submit("slow.py").unwrap();
        let job = wait_terminal(&scheduler, id).await;

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some(RENDER_TIMEOUT_MESSAGE));
        assert_eq!(scheduler.stats().jobs_timed_out, 1);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_outer_timeout_catches_hanging_renderer() {
        let config = SchedulerConfig::default()
            .with_render_timeout(Duration::from_millis(30))
            .with_kill_grace(Duration::from_millis(20));
        let scheduler = scheduler_with(HangingRenderer, config);
        scheduler.start().await.unwrap();

        let id = scheduler.submit("hang.py").unwrap();
        let job = wait_terminal(&scheduler, id).await;

        assert_eq!(job.error_message.as_deref(), Some(RENDER_TIMEOUT_MESSAGE));
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_contains_renderer_panic() {
        let renderer = FakeRenderer {
            panic: true,
            ..FakeRenderer::ok(Duration::ZERO)
        };
        let scheduler = scheduler_with(renderer, SchedulerConfig::new(1));
        scheduler.start().await.unwrap();

        let first = scheduler.submit("a.py").unwrap();
        let second = scheduler.submit("b.py").unwrap();

        for id in [first, second] {
            let job = wait_terminal(&scheduler, id).await;
            assert_eq!(job.error_message.as_deref(), Some(INTERNAL_FAILURE_MESSAGE));
        }
        assert!(scheduler.is_running());
        scheduler.shutdown().await.unwrap();
    }

    /// Error whose message cannot be rendered.
    #[derive(Debug)]
    struct UnprintableError;

    impl std::fmt::Display for UnprintableError {
        fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            panic!("display exploded")
        }
    }

    impl std::error::Error for UnprintableError {}

    struct UnprintableRenderer;

    #[async_trait]
    impl Renderer for UnprintableRenderer {
        async fn render(&self, _: &Path, _: &Path, _: Duration) -> Result<PathBuf, RenderError> {
            Err(RenderError::Io(std::io::Error::other(UnprintableError)))
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panic_outside_renderer() {
        let scheduler = scheduler_with(UnprintableRenderer, SchedulerConfig::new(1));
        scheduler.start().await.unwrap();

        let first = scheduler.submit("a.py").unwrap();
        let second = scheduler.submit("b.py").unwrap();

        for id in [first, second] {
            let job = wait_terminal(&scheduler, id).await;
            assert_eq!(job.status, JobStatus::Error);
            assert_eq!(job.error_message.as_deref(), Some(INTERNAL_FAILURE_MESSAGE));
        }
        assert_eq!(scheduler.stats().active_workers, 0);
        assert!(scheduler.is_running());
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_huge_render_timeout_does_not_overflow() {
        let config = SchedulerConfig::default()
            .with_render_timeout(Duration::MAX)
            .with_kill_grace(Duration::from_secs(5));
        let scheduler = scheduler_with(FakeRenderer::ok(Duration::from_millis(5)), config);
        scheduler.start().await.unwrap();

        let id = scheduler.submit("scene.py").unwrap();
        let job = wait_terminal(&scheduler, id).await;
        assert_eq!(job.status, JobStatus::Ready);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_refused_when_queue_full() {
        let scheduler = scheduler_with(
            FakeRenderer::ok(Duration::ZERO),
            SchedulerConfig::default().with_max_queue_depth(2),
        );

        scheduler.submit("a.py").unwrap();
        scheduler.submit("b.py").unwrap();
        let err = scheduler.submit("c.py").unwrap_err();

        assert!(matches!(err, SchedulerError::QueueFull { depth: 2 }));
        assert_eq!(scheduler.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_submit_existing() {
        let scheduler = scheduler_with(FakeRenderer::ok(Duration::ZERO), SchedulerConfig::default());
        let id = scheduler.registry().create("pre.py");

        scheduler.submit_existing(id).unwrap();
        assert_eq!(scheduler.queue_depth(), 1);

        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            scheduler.submit_existing(missing),
            Err(SchedulerError::Registry(RegistryError::NotFound(_)))
        ));

        scheduler.start().await.unwrap();
        let job = wait_terminal(&scheduler, id).await;
        assert_eq!(job.status, JobStatus::Ready);
        assert!(matches!(
            scheduler.submit_existing(id),
            Err(SchedulerError::Registry(RegistryError::InvalidTransition { .. }))
        ));
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_each_job_rendered_once() {
        let renderer = Arc::new(FakeRenderer::ok(Duration::from_millis(5)));
        let registry = Arc::new(JobRegistry::new());
        let scheduler = RenderScheduler::new(
            SchedulerConfig::new(4).with_output_dir(std::env::temp_dir()),
            Arc::clone(&registry),
            Arc::clone(&renderer) as Arc<dyn Renderer>,
        );
        scheduler.start().await.unwrap();

        let ids: Vec<_> = (0..10)
            .map(|i| scheduler.submit(format!("{i}.py")).unwrap())
            .collect();
        for id in &ids {
            assert_eq!(wait_terminal(&scheduler, *id).await.status, JobStatus::Ready);
        }

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 10);
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_shutdown_lifecycle() {
        let scheduler = scheduler_with(FakeRenderer::ok(Duration::ZERO), SchedulerConfig::default());

        assert!(matches!(scheduler.shutdown().await, Err(SchedulerError::NotRunning)));
        scheduler.start().await.unwrap();
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));
        scheduler.shutdown().await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_scheduler_error_display() {
        assert!(SchedulerError::AlreadyRunning.to_string().contains("already running"));
        assert!(SchedulerError::NotRunning.to_string().contains("not running"));
        assert!(SchedulerError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
        assert!(SchedulerError::QueueFull { depth: 3 }.to_string().contains('3'));
    }
}
