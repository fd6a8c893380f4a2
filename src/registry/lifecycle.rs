//! Job lifecycle transition rules.
//!
//! Valid transitions:
//! - Queued -> Rendering (a worker picked the job up)
//! - Queued -> Error (the job could not be started, or was abandoned)
//! - Rendering -> Ready (render produced an output file)
//! - Rendering -> Error (render failed or timed out)
//!
//! `Ready` and `Error` are terminal.

use super::job::JobStatus;

/// Returns the statuses reachable from `from` in a single step.
pub fn valid_targets(from: JobStatus) -> &'static [JobStatus] {
    match from {
        JobStatus::Queued => &[JobStatus::Rendering, JobStatus::Error],
        JobStatus::Rendering => &[JobStatus::Ready, JobStatus::Error],
        JobStatus::Ready | JobStatus::Error => &[],
    }
}

/// Check if a transition between two statuses is allowed.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_targets(from).contains(&to)
}
