//! Background resource and cleanup management.
//!
//! The [`ResourceManager`] wakes up on a fixed interval and:
//!
//! 1. samples host memory and CPU through a [`ResourceProbe`]
//! 2. under pressure, runs an emergency pass with a short retention age
//! 3. runs the standard pass with the normal retention age
//! 4. forgets rate-limit state of idle identities
//!
//! A pass walks the jobs whose reference time is older than its age. Finished
//! jobs get their output file and stored source deleted and are evicted.
//! Unfinished jobs are left alone unless they are older than `stuck_age`, in
//! which case they are failed as abandoned and kept until they age out like
//! any other failed job.

pub mod probe;
pub mod storage;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::metrics::MetricsCollector;
use crate::ratelimit::RateLimiter;
use crate::registry::{JobRegistry, Transition};

pub use probe::{ProcProbe, ResourceProbe, ResourceUsage};
pub use storage::{DeleteOutcome, FileStore, LocalFileStore, StoredFile};

/// Error message stored on jobs reclaimed by cleanup.
pub const ABANDONED_MESSAGE: &str = "render abandoned";

/// Errors from the resource manager lifecycle.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Resource manager is already running")]
    AlreadyRunning,

    #[error("Resource manager is not running")]
    NotRunning,
}

/// Resource manager settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    /// Time between cleanup cycles.
    pub interval: Duration,
    /// Retention age of the standard pass.
    pub normal_age: Duration,
    /// Retention age of the emergency pass.
    pub emergency_age: Duration,
    /// Age after which an unfinished job is considered abandoned. Kept well
    /// above `normal_age`, since a full queue can hold work for hours.
    pub stuck_age: Duration,
    /// Memory usage percentage that triggers the emergency pass.
    pub memory_threshold: f64,
    /// CPU usage percentage that triggers the emergency pass.
    pub cpu_threshold: f64,
    /// Inactivity after which rate-limit state of an identity is dropped.
    pub rate_limit_idle: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            normal_age: Duration::from_secs(24 * 3600),
            emergency_age: Duration::from_secs(10 * 60),
            stuck_age: Duration::from_secs(3 * 24 * 3600),
            memory_threshold: 85.0,
            cpu_threshold: 90.0,
            rate_limit_idle: Duration::from_secs(600),
        }
    }
}

impl ResourceConfig {
    /// Returns whether a sample calls for an emergency pass.
    pub fn under_pressure(&self, usage: &ResourceUsage) -> bool {
        usage.memory_percent.is_some_and(|m| m > self.memory_threshold)
            || usage.cpu_percent.is_some_and(|c| c > self.cpu_threshold)
    }
}

/// Outcome of one cleanup cycle or pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Jobs removed from the registry.
    pub evicted: usize,
    /// Output files removed from storage.
    pub files_deleted: usize,
    /// Stored source files removed.
    pub sources_deleted: usize,
    /// Unfinished jobs failed as abandoned.
    pub stuck_reclaimed: usize,
    /// Jobs that could not be cleaned up and were kept for a later cycle.
    pub failures: usize,
    /// Whether an emergency pass ran.
    pub emergency: bool,
    /// Rate-limit keys forgotten.
    pub rate_limit_keys_purged: usize,
    /// Resource sample taken at the start of the cycle.
    pub usage: ResourceUsage,
}

impl CleanupReport {
    fn absorb(&mut self, pass: CleanupReport) {
        self.evicted += pass.evicted;
        self.files_deleted += pass.files_deleted;
        self.sources_deleted += pass.sources_deleted;
        self.stuck_reclaimed += pass.stuck_reclaimed;
        self.failures += pass.failures;
    }
}

/// Periodic cleanup of expired jobs, their files and idle limiter state.
pub struct ResourceManager {
    config: ResourceConfig,
    registry: Arc<JobRegistry>,
    store: Arc<dyn FileStore>,
    sources: Option<Arc<dyn FileStore>>,
    probe: Arc<dyn ResourceProbe>,
    limiter: Option<Arc<RateLimiter>>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: MetricsCollector,
}

impl ResourceManager {
    pub fn new(
        config: ResourceConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn FileStore>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            store,
            sources: None,
            probe,
            limiter: None,
            shutdown_tx,
            handle: Mutex::new(None),
            metrics: MetricsCollector::new(),
        }
    }

    /// Also purges idle identities from `limiter` on every cycle.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Also deletes job sources held by `sources` when their job is evicted.
    pub fn with_source_store(mut self, sources: Arc<dyn FileStore>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Runs one full cleanup cycle.
    pub async fn run_cycle(&self) -> CleanupReport {
        let usage = self.probe.sample().await;
        self.metrics
            .update_resource_usage(usage.memory_percent, usage.cpu_percent);

        let mut report = CleanupReport {
            usage,
            ..CleanupReport::default()
        };

        if self.config.under_pressure(&usage) {
            warn!(
                memory_percent = ?usage.memory_percent,
                cpu_percent = ?usage.cpu_percent,
                "Resource pressure detected, running emergency cleanup"
            );
            report.emergency = true;
            let pass = self.sweep(self.config.emergency_age, "emergency").await;
            report.absorb(pass);
        }

        let pass = self.sweep(self.config.normal_age, "standard").await;
        report.absorb(pass);

        if let Some(limiter) = &self.limiter {
            report.rate_limit_keys_purged = limiter.purge_idle(self.config.rate_limit_idle);
        }

        info!(
            evicted = report.evicted,
            files_deleted = report.files_deleted,
            sources_deleted = report.sources_deleted,
            stuck_reclaimed = report.stuck_reclaimed,
            failures = report.failures,
            emergency = report.emergency,
            remaining_jobs = self.registry.len(),
            "Cleanup cycle finished"
        );

        report
    }

    /// Runs a single pass with a caller-chosen retention age.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> CleanupReport {
        self.sweep(max_age, "manual").await
    }

    async fn sweep(&self, max_age: Duration, pass: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let stuck_age = chrono::Duration::from_std(self.config.stuck_age)
            .unwrap_or(chrono::Duration::MAX);

        let expired = self.registry.list_expired(max_age);
        for id in &expired {
            let job = match self.registry.get(id) {
                Ok(job) => job,
                Err(_) => continue,
            };

            if !job.status.is_terminal() {
                if job.age() < stuck_age {
                    continue;
                }
                match self.registry.transition(id, Transition::fail(ABANDONED_MESSAGE)) {
                    Ok(_) => {
                        warn!(job_id = %id, status = %job.status, "Reclaimed abandoned job");
                        report.stuck_reclaimed += 1;
                    }
                    // Finished or evicted concurrently; a later cycle sees the new state.
                    Err(RegistryError::InvalidTransition { .. } | RegistryError::NotFound(_)) => {}
                    Err(e) => {
                        error!(job_id = %id, error = %e, "Failed to reclaim abandoned job");
                        report.failures += 1;
                    }
                }
                // Stays pollable as `error` until it ages out from its completion time.
                continue;
            }

            if let Some(location) = job.output_location.as_deref() {
                match self.store.delete(location).await {
                    Ok(DeleteOutcome::Deleted) => report.files_deleted += 1,
                    Ok(DeleteOutcome::NotFound) => {
                        debug!(job_id = %id, location = location, "Output already removed");
                    }
                    Err(e) => {
                        warn!(job_id = %id, location = location, error = %e, "Failed to delete output, keeping job");
                        report.failures += 1;
                        continue;
                    }
                }
            }

            if let Some(sources) = &self.sources {
                let source = job.source_file.to_string_lossy();
                if sources.holds(&source) {
                    match sources.delete(&source).await {
                        Ok(DeleteOutcome::Deleted) => report.sources_deleted += 1,
                        Ok(DeleteOutcome::NotFound) => {}
                        Err(e) => {
                            warn!(job_id = %id, source = %source, error = %e, "Failed to delete source, keeping job");
                            report.failures += 1;
                            continue;
                        }
                    }
                }
            }

            if self.registry.evict(id).is_some() {
                report.evicted += 1;
            }
        }

        self.metrics.record_cleanup(pass, report.evicted);
        debug!(
            pass = pass,
            max_age_secs = max_age.as_secs(),
            evicted = report.evicted,
            "Cleanup pass finished"
        );
        report
    }

    /// Starts the periodic cleanup task.
    ///
    /// The first cycle runs one `interval` after start.
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::AlreadyRunning` if the task is already running.
    pub fn start(self: &Arc<Self>) -> Result<(), ResourceError> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Err(ResourceError::AlreadyRunning);
        }

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            info!(
                interval_secs = manager.config.interval.as_secs(),
                "Resource manager started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if AssertUnwindSafe(manager.run_cycle()).catch_unwind().await.is_err() {
                            error!("Cleanup cycle panicked, will retry next interval");
                        }
                    }
                }
            }

            info!("Resource manager stopped");
        }));

        Ok(())
    }

    /// Stops the periodic task, letting an in-flight cycle finish.
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::NotRunning` if the task was not started.
    pub async fn stop(&self) -> Result<(), ResourceError> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ResourceError::NotRunning)?;

        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "Resource manager task ended abnormally");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::registry::{JobId, JobStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FixedProbe(ResourceUsage);

    #[async_trait]
    impl ResourceProbe for FixedProbe {
        async fn sample(&self) -> ResourceUsage {
            self.0
        }
    }

    fn calm() -> Arc<FixedProbe> {
        Arc::new(FixedProbe(ResourceUsage {
            memory_percent: Some(40.0),
            cpu_percent: Some(10.0),
            process_rss_bytes: None,
        }))
    }

    /// Store that counts deletions and can be told to fail them.
    struct CountingStore {
        deletes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl FileStore for CountingStore {
        async fn save(&self, file_name: &str, _data: &[u8]) -> Result<StoredFile, StorageError> {
            Ok(StoredFile {
                path: file_name.into(),
                url: self.public_url(file_name),
            })
        }

        async fn delete(&self, _location: &str) -> Result<DeleteOutcome, StorageError> {
            if self.fail {
                return Err(StorageError::Io(std::io::Error::other("disk unavailable")));
            }
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(DeleteOutcome::Deleted)
        }

        fn public_url(&self, location: &str) -> String {
            format!("/static/videos/{location}")
        }

        fn holds(&self, _location: &str) -> bool {
            true
        }
    }

    fn finished_job(registry: &JobRegistry, output: &str) -> JobId {
        let id = registry.create("scene.py");
        registry.transition(id, Transition::Start).unwrap();
        registry.transition(id, Transition::complete(output)).unwrap();
        id
    }

    fn manager_with(
        registry: Arc<JobRegistry>,
        store: Arc<dyn FileStore>,
        probe: Arc<dyn ResourceProbe>,
    ) -> ResourceManager {
        ResourceManager::new(ResourceConfig::default(), registry, store, probe)
    }

    #[tokio::test]
    async fn test_standard_pass_evicts_old_jobs_and_deletes_files() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalFileStore::new(dir.path(), "/static/videos"));
        let registry = Arc::new(JobRegistry::new());

        let stored = store.save("old.mp4", b"frames").await.unwrap();
        let old = finished_job(&registry, &stored.path.to_string_lossy());
        let fresh = finished_job(&registry, "fresh.mp4");
        registry.backdate(old, chrono::Duration::hours(25));

        let manager = manager_with(registry.clone(), store, calm());
        let report = manager.run_cycle().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.files_deleted, 1);
        assert!(!report.emergency);
        assert!(!stored.path.exists());
        assert!(matches!(registry.get(old), Err(RegistryError::NotFound(_))));
        assert!(registry.contains(fresh));

        // A second cycle has nothing left to do.
        let report = manager.run_cycle().await;
        assert_eq!(report.evicted, 0);
        assert_eq!(report.files_deleted, 0);
    }

    #[tokio::test]
    async fn test_emergency_pass_under_memory_pressure() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: false,
        });
        let recent = finished_job(&registry, "recent.mp4");
        let very_recent = finished_job(&registry, "very_recent.mp4");
        registry.backdate(recent, chrono::Duration::minutes(30));

        let probe = Arc::new(FixedProbe(ResourceUsage {
            memory_percent: Some(92.0),
            cpu_percent: None,
            process_rss_bytes: None,
        }));
        let manager = manager_with(registry.clone(), store.clone(), probe);
        let report = manager.run_cycle().await;

        assert!(report.emergency);
        assert_eq!(report.evicted, 1);
        assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(recent));
        assert!(registry.contains(very_recent));
    }

    #[tokio::test]
    async fn test_rendering_job_is_never_evicted_before_stuck_age() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: false,
        });
        let rendering = registry.create("scene.py");
        registry.transition(rendering, Transition::Start).unwrap();
        let queued = registry.create("other.py");
        registry.backdate(rendering, chrono::Duration::minutes(90));
        registry.backdate(queued, chrono::Duration::minutes(90));

        let manager = manager_with(registry.clone(), store, calm());
        let report = manager.cleanup_older_than(Duration::from_secs(60)).await;

        assert_eq!(report.evicted, 0);
        assert_eq!(registry.get(rendering).unwrap().status, JobStatus::Rendering);
        assert_eq!(registry.get(queued).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_stuck_jobs_are_failed_and_stay_pollable() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: false,
        });
        let stuck = registry.create("scene.py");
        registry.transition(stuck, Transition::Start).unwrap();
        registry.backdate(stuck, chrono::Duration::hours(80));

        let manager = manager_with(registry.clone(), store.clone(), calm());
        let report = manager.run_cycle().await;

        assert_eq!(report.stuck_reclaimed, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(store.deletes.load(Ordering::SeqCst), 0);

        let job = registry.get(stuck).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some(ABANDONED_MESSAGE));
        assert!(job.age() > chrono::Duration::hours(79));

        // Ages out from its completion time like any failed job.
        let report = manager.run_cycle().await;
        assert_eq!(report.evicted, 0);
        assert!(registry.contains(stuck));

        registry.backdate(stuck, chrono::Duration::hours(25));
        let report = manager.run_cycle().await;
        assert_eq!(report.evicted, 1);
        assert!(!registry.contains(stuck));
    }

    #[tokio::test]
    async fn test_queued_job_survives_emergency_pass_with_defaults() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: false,
        });
        let waiting = registry.create("scene.py");
        registry.backdate(waiting, chrono::Duration::minutes(150));

        let probe = Arc::new(FixedProbe(ResourceUsage {
            memory_percent: Some(95.0),
            cpu_percent: None,
            process_rss_bytes: None,
        }));
        let manager = manager_with(registry.clone(), store, probe);
        assert!(manager.config().stuck_age > manager.config().normal_age);

        let report = manager.run_cycle().await;

        assert!(report.emergency);
        assert_eq!(report.stuck_reclaimed, 0);
        assert_eq!(report.evicted, 0);
        assert_eq!(registry.get(waiting).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_evicted_jobs_take_their_stored_source_along() {
        let outputs_dir = TempDir::new().unwrap();
        let sources_dir = TempDir::new().unwrap();
        let outputs = Arc::new(LocalFileStore::new(outputs_dir.path(), "/static/videos"));
        let sources = Arc::new(LocalFileStore::new(sources_dir.path(), "/static/videos"));
        let registry = Arc::new(JobRegistry::new());

        let code = sources.save("intro_20250101_000000.py", b"class Intro(Scene): pass").await.unwrap();
        let external = outputs_dir.path().join("external.py");
        std::fs::write(&external, b"class External(Scene): pass").unwrap();

        let stored = registry.create(code.path.clone());
        registry.transition(stored, Transition::fail("boom")).unwrap();
        let user_owned = registry.create(external.clone());
        registry.transition(user_owned, Transition::fail("boom")).unwrap();
        registry.backdate(stored, chrono::Duration::minutes(1));
        registry.backdate(user_owned, chrono::Duration::minutes(1));

        let manager = ResourceManager::new(ResourceConfig::default(), registry.clone(), outputs, calm())
            .with_source_store(sources);
        let report = manager.cleanup_older_than(Duration::ZERO).await;

        assert_eq!(report.evicted, 2);
        assert_eq!(report.sources_deleted, 1);
        assert!(!code.path.exists());
        assert!(external.exists());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_job_for_retry() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: true,
        });
        let id = finished_job(&registry, "out.mp4");
        registry.backdate(id, chrono::Duration::days(2));

        let manager = manager_with(registry.clone(), store, calm());
        let report = manager.run_cycle().await;

        assert_eq!(report.failures, 1);
        assert_eq!(report.evicted, 0);
        assert!(registry.contains(id));
    }

    #[tokio::test]
    async fn test_failed_jobs_evicted_without_file_delete() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: false,
        });
        let id = registry.create("scene.py");
        registry.transition(id, Transition::fail("boom")).unwrap();
        registry.backdate(id, chrono::Duration::days(2));

        let manager = manager_with(registry.clone(), store.clone(), calm());
        let report = manager.run_cycle().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.files_deleted, 0);
        assert_eq!(store.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cycle_purges_idle_rate_limit_state() {
        use crate::clock::ManualClock;
        use crate::ratelimit::RateLimitConfig;

        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::with_clock(
            RateLimitConfig::default(),
            clock.clone(),
        ));
        limiter.check("10.0.0.1", "/api/render");
        clock.advance(Duration::from_secs(3600));

        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: false,
        });
        let manager = manager_with(registry, store, calm()).with_rate_limiter(limiter.clone());

        let report = manager.run_cycle().await;
        assert!(report.rate_limit_keys_purged >= 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_lifecycle() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(CountingStore {
            deletes: AtomicUsize::new(0),
            fail: false,
        });
        let id = finished_job(&registry, "old.mp4");
        registry.backdate(id, chrono::Duration::days(2));

        let config = ResourceConfig {
            interval: Duration::from_secs(60),
            ..ResourceConfig::default()
        };
        let manager = Arc::new(ResourceManager::new(config, registry.clone(), store, calm()));

        manager.start().unwrap();
        assert!(manager.is_running());
        assert!(matches!(manager.start(), Err(ResourceError::AlreadyRunning)));

        // No cycle at start.
        tokio::task::yield_now().await;
        assert!(registry.contains(id));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!registry.contains(id));

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert!(matches!(manager.stop().await, Err(ResourceError::NotRunning)));
    }

    #[test]
    fn test_under_pressure_thresholds() {
        let config = ResourceConfig::default();
        let usage = |m, c| ResourceUsage {
            memory_percent: m,
            cpu_percent: c,
            process_rss_bytes: None,
        };
        assert!(!config.under_pressure(&usage(None, None)));
        assert!(!config.under_pressure(&usage(Some(85.0), Some(90.0))));
        assert!(config.under_pressure(&usage(Some(85.1), None)));
        assert!(config.under_pressure(&usage(None, Some(95.0))));
    }
}
