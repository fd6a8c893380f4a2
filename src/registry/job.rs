//! Render job records.
//!
//! This module defines the core job types tracked by the registry:
//!
//! - `Job`: one unit of render work from submission to terminal state
//! - `JobStatus`: where the job is in its lifecycle
//! - `Transition`: a requested status change together with its payload

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lifecycle;
use crate::error::RegistryError;

/// Identifier of a render job.
pub type JobId = Uuid;

/// Message stored when a failure arrives without any text.
const UNKNOWN_ERROR_MESSAGE: &str = "unknown error";

/// Status of a render job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// A worker is running the external renderer.
    Rendering,
    /// Render finished and produced an output file.
    Ready,
    /// Render failed, timed out, or was abandoned.
    Error,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Rendering,
        JobStatus::Ready,
        JobStatus::Error,
    ];

    /// Returns whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Error)
    }

    /// Returns the lowercase wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Rendering => "rendering",
            JobStatus::Ready => "ready",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `queued -> rendering`.
    Start,
    /// `rendering -> ready`.
    Complete { output_location: String },
    /// `queued | rendering -> error`.
    Fail { message: String },
}

impl Transition {
    /// Status the job ends up in once the transition is applied.
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start => JobStatus::Rendering,
            Transition::Complete { .. } => JobStatus::Ready,
            Transition::Fail { .. } => JobStatus::Error,
        }
    }

    /// Shorthand for a failure transition.
    pub fn fail(message: impl Into<String>) -> Self {
        Transition::Fail {
            message: message.into(),
        }
    }

    /// Shorthand for a completion transition.
    pub fn complete(output_location: impl Into<String>) -> Self {
        Transition::Complete {
            output_location: output_location.into(),
        }
    }
}

/// A render job.
///
/// The registry holds the canonical copy; everything handed out to callers is
/// a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When a worker picked the job up.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Location of the rendered file, set only when `ready`.
    #[serde(default)]
    pub output_location: Option<String>,
    /// Failure description, set only when `error`.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Code artifact the renderer consumes.
    pub source_file: PathBuf,
}

impl Job {
    /// Creates a new queued job for the given source file.
    pub fn new(source_file: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output_location: None,
            error_message: None,
            source_file: source_file.into(),
        }
    }

    /// Applies a transition in place.
    ///
    /// The job is left untouched when the transition is rejected.
    pub(crate) fn apply(&mut self, transition: Transition) -> Result<(), RegistryError> {
        let to = transition.target();
        if !lifecycle::can_transition(self.status, to) {
            return Err(RegistryError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Start => {
                self.started_at = Some(now);
            }
            Transition::Complete { output_location } => {
                if output_location.trim().is_empty() {
                    return Err(RegistryError::MissingOutput(self.id));
                }
                self.output_location = Some(output_location);
                self.completed_at = Some(now);
            }
            Transition::Fail { message } => {
                let message = if message.trim().is_empty() {
                    UNKNOWN_ERROR_MESSAGE.to_string()
                } else {
                    message
                };
                self.error_message = Some(message);
                self.completed_at = Some(now);
            }
        }
        self.status = to;

        Ok(())
    }

    /// Timestamp that ages the job: completion if terminal, creation otherwise.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    /// Time from submission to terminal status, if the job has finished.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }

    /// Time spent rendering so far (or in total, once finished).
    pub fn render_time(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Utc::now) - started)
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_new() {
        let job = Job::new("/tmp/scene.py");

        assert!(!job.id.is_nil());
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.output_location.is_none());
        assert!(job.error_message.is_none());
        assert_eq!(job.reference_time(), job.created_at);
    }

    #[test]
    fn test_job_happy_path() {
        let mut job = Job::new("scene.py");

        job.apply(Transition::Start).expect("start");
        assert_eq!(job.status, JobStatus::Rendering);
        assert!(job.started_at.is_some());

        job.apply(Transition::complete("/videos/scene.mp4"))
            .expect("complete");
        assert_eq!(job.status, JobStatus::Ready);
        assert_eq!(job.output_location.as_deref(), Some("/videos/scene.mp4"));
        assert!(job.error_message.is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(job.reference_time(), job.completed_at.unwrap());
    }

    #[test]
    fn test_job_rejects_backwards_transition() {
        let mut job = Job::new("scene.py");
        job.apply(Transition::Start).unwrap();
        job.apply(Transition::fail("boom")).unwrap();

        let err = job.apply(Transition::Start).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                from: JobStatus::Error,
                to: JobStatus::Rendering
            }
        );
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_job_cannot_complete_without_rendering() {
        let mut job = Job::new("scene.py");
        let err = job.apply(Transition::complete("out.mp4")).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_job_empty_output_rejected() {
        let mut job = Job::new("scene.py");
        job.apply(Transition::Start).unwrap();

        let err = job.apply(Transition::complete("  ")).unwrap_err();
        assert_eq!(err, RegistryError::MissingOutput(job.id));
        assert_eq!(job.status, JobStatus::Rendering);
        assert!(job.output_location.is_none());
    }

    #[test]
    fn test_job_empty_error_message_replaced() {
        let mut job = Job::new("scene.py");
        job.apply(Transition::fail("")).unwrap();

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some(UNKNOWN_ERROR_MESSAGE));
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(format!("{}", JobStatus::Queued), "queued");
        assert_eq!(format!("{}", JobStatus::Rendering), "rendering");
        assert_eq!(format!("{}", JobStatus::Ready), "ready");
        assert_eq!(format!("{}", JobStatus::Error), "error");
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new("scene.py");

        let json = serde_json::to_string(&job).expect("serialization should work");
        assert!(json.contains("\"status\":\"queued\""));

        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.status, job.status);
    }
}
