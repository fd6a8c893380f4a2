//! In-memory job registry.
//!
//! The registry owns the canonical record for every render job and enforces
//! its state machine. Records live in a [`DashMap`], so operations on distinct
//! ids never contend on the same lock.

pub mod history;
pub mod job;
pub mod lifecycle;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RegistryError;

pub use history::{JobHistory, JobSummary, DEFAULT_HISTORY_CAPACITY};
pub use job::{Job, JobId, JobStatus, Transition};

/// Per-job wait assumed when no render has finished yet.
const FALLBACK_WAIT_PER_JOB: Duration = Duration::from_secs(30);

/// Aggregate view over live jobs and the finished-job history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryMetrics {
    pub total_jobs: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Ready share of finished jobs, in percent.
    pub success_rate: f64,
    /// Error share of finished jobs, in percent.
    pub error_rate: f64,
    /// Mean submission-to-ready time in seconds.
    pub average_processing_secs: Option<f64>,
    pub history_size: usize,
}

/// Concurrent store of render jobs.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Job>,
    history: Mutex<JobHistory>,
}

impl JobRegistry {
    /// Creates an empty registry with the default history capacity.
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            history: Mutex::new(JobHistory::new(capacity)),
        }
    }

    /// Inserts a new `queued` job and returns its id.
    pub fn create(&self, source_file: impl Into<PathBuf>) -> JobId {
        let job = Job::new(source_file);
        let id = job.id;
        debug!(job_id = %id, source = %job.source_file.display(), "Job created");
        self.jobs.insert(id, job);
        id
    }

    /// Applies a transition and returns the updated snapshot.
    ///
    /// # Errors
    /// - `NotFound` if the id is unknown or already evicted
    /// - `InvalidTransition` if the move is not forward along the lifecycle
    /// - `MissingOutput` if a completion carries no output location
    pub fn transition(&self, id: JobId, transition: Transition) -> Result<Job, RegistryError> {
        let snapshot = {
            let mut entry = self.jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            entry.value_mut().apply(transition)?;
            entry.value().clone()
        };

        if let Some(summary) = JobSummary::from_job(&snapshot) {
            info!(
                job_id = %id,
                status = %snapshot.status,
                processing_secs = summary.processing_time_secs,
                "Job finished"
            );
            self.lock_history().record(summary);
        } else {
            debug!(job_id = %id, status = %snapshot.status, "Job transitioned");
        }

        Ok(snapshot)
    }

    /// Returns a snapshot of the job.
    pub fn get(&self, id: JobId) -> Result<Job, RegistryError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NotFound(id))
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Returns the ids whose reference time is older than `older_than`.
    ///
    /// The candidate keys are captured now; each one is re-checked against the
    /// live map while iterating, so jobs evicted or advanced in between are
    /// skipped.
    pub fn list_expired(&self, older_than: Duration) -> ExpiredJobs<'_> {
        ExpiredJobs {
            registry: self,
            candidates: self.jobs.iter().map(|entry| *entry.key()).collect(),
            cutoff: cutoff_before(Utc::now(), older_than),
        }
    }

    /// Removes the job. Evicting an unknown id is a no-op.
    pub fn evict(&self, id: JobId) -> Option<Job> {
        let removed = self.jobs.remove(&id).map(|(_, job)| job);
        if removed.is_some() {
            debug!(job_id = %id, "Job evicted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn counts_by_status(&self) -> BTreeMap<JobStatus, usize> {
        let mut counts: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for entry in self.jobs.iter() {
            *counts.entry(entry.status).or_default() += 1;
        }
        counts
    }

    /// Snapshots of all jobs, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| status.is_none_or(|s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of jobs that are queued or rendering.
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .count()
    }

    /// 1-based position of a queued job, ordered by submission time.
    ///
    /// Returns `None` if the job is unknown or no longer queued.
    pub fn queue_position(&self, id: JobId) -> Option<usize> {
        let created_at = {
            let entry = self.jobs.get(&id)?;
            if entry.status != JobStatus::Queued {
                return None;
            }
            entry.created_at
        };

        let ahead = self
            .jobs
            .iter()
            .filter(|entry| {
                entry.status == JobStatus::Queued
                    && entry.id != id
                    && (entry.created_at, entry.id) < (created_at, id)
            })
            .count();
        Some(ahead + 1)
    }

    /// Rough wait before a queued job starts rendering.
    pub fn estimated_wait(&self, id: JobId) -> Option<Duration> {
        let position = self.queue_position(id)?;
        let per_job = self
            .lock_history()
            .average_processing_secs()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(FALLBACK_WAIT_PER_JOB);
        Some(per_job * (position as u32 - 1))
    }

    /// Most recent finished jobs, newest first.
    pub fn history(&self, limit: usize) -> Vec<JobSummary> {
        self.lock_history().recent(limit)
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let by_status = self
            .counts_by_status()
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();

        let history = self.lock_history();
        let (ready, error) = history.outcome_counts();
        let finished = ready + error;
        let (success_rate, error_rate) = if finished == 0 {
            (0.0, 0.0)
        } else {
            (
                ready as f64 * 100.0 / finished as f64,
                error as f64 * 100.0 / finished as f64,
            )
        };

        RegistryMetrics {
            total_jobs: self.jobs.len(),
            by_status,
            success_rate,
            error_rate,
            average_processing_secs: history.average_processing_secs(),
            history_size: history.len(),
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, JobHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl JobRegistry {
    /// Shifts every timestamp of a job into the past.
    pub(crate) fn backdate(&self, id: JobId, by: chrono::Duration) {
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            entry.created_at -= by;
            if let Some(started) = entry.started_at.as_mut() {
                *started -= by;
            }
            if let Some(done) = entry.completed_at.as_mut() {
                *done -= by;
            }
        }
    }
}

/// Computes `now - age`, saturating at the earliest representable instant.
pub(crate) fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Expired job ids, re-iterable from the start.
#[derive(Debug, Clone)]
pub struct ExpiredJobs<'a> {
    registry: &'a JobRegistry,
    candidates: Vec<JobId>,
    cutoff: DateTime<Utc>,
}

impl<'a> ExpiredJobs<'a> {
    pub fn iter(&self) -> ExpiredIter<'_> {
        ExpiredIter {
            registry: self.registry,
            candidates: self.candidates.iter(),
            cutoff: self.cutoff,
        }
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }
}

impl<'s> IntoIterator for &'s ExpiredJobs<'_> {
    type Item = JobId;
    type IntoIter = ExpiredIter<'s>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Cursor over [`ExpiredJobs`].
#[derive(Debug, Clone)]
pub struct ExpiredIter<'a> {
    registry: &'a JobRegistry,
    candidates: std::slice::Iter<'a, JobId>,
    cutoff: DateTime<Utc>,
}

impl Iterator for ExpiredIter<'_> {
    type Item = JobId;

    fn next(&mut self) -> Option<JobId> {
        for id in self.candidates.by_ref() {
            let expired = self
                .registry
                .jobs
                .get(id)
                .map(|job| job.reference_time() < self.cutoff)
                .unwrap_or(false);
            if expired {
                return Some(*id);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.candidates.len()))
    }
}
