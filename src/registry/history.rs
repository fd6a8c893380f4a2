//! Bounded history of finished jobs.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobId, JobStatus};

/// Default number of finished jobs remembered.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Condensed record of a job that reached a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Submission to completion, in seconds.
    pub processing_time_secs: f64,
}

impl JobSummary {
    /// Builds a summary from a terminal job, or `None` if it has not finished.
    pub fn from_job(job: &Job) -> Option<Self> {
        if !job.status.is_terminal() {
            return None;
        }
        let completed_at = job.completed_at?;
        let processing = completed_at - job.created_at;
        Some(Self {
            id: job.id,
            status: job.status,
            created_at: job.created_at,
            completed_at,
            processing_time_secs: processing.num_milliseconds().max(0) as f64 / 1000.0,
        })
    }
}

/// Ring buffer of finished jobs, oldest dropped first.
#[derive(Debug)]
pub struct JobHistory {
    entries: VecDeque<JobSummary>,
    capacity: usize,
}

impl JobHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
        }
    }

    pub fn record(&mut self, summary: JobSummary) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(summary);
    }

    /// Most recent entries first, at most `limit` of them.
    pub fn recent(&self, limit: usize) -> Vec<JobSummary> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mean processing time of successful renders, in seconds.
    pub fn average_processing_secs(&self) -> Option<f64> {
        let (sum, count) = self
            .entries
            .iter()
            .filter(|s| s.status == JobStatus::Ready)
            .fold((0.0, 0usize), |(sum, count), s| {
                (sum + s.processing_time_secs, count + 1)
            });
        (count > 0).then(|| sum / count as f64)
    }

    /// Returns `(ready, error)` counts.
    pub fn outcome_counts(&self) -> (usize, usize) {
        self.entries
            .iter()
            .fold((0, 0), |(ready, error), s| match s.status {
                JobStatus::Ready => (ready + 1, error),
                JobStatus::Error => (ready, error + 1),
                _ => (ready, error),
            })
    }
}

impl Default for JobHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
