//! Error types for render-forge operations.
//!
//! Defines error types for each subsystem:
//! - Job registry integrity (unknown ids, illegal transitions)
//! - Render scheduling and external renderer execution
//! - Upstream generation service calls
//! - Output file storage
//! - Caller-facing service errors with HTTP status mapping

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::registry::JobStatus;

/// Errors that can occur during job registry operations.
///
/// Both variants indicate a caller bug: a correct caller never polls an id it
/// did not receive, and never moves a job backwards.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job {0} cannot become ready without an output location")]
    MissingOutput(Uuid),
}

/// Errors reported by an external renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Renderer exited with code {code:?}: {output}")]
    Failed { code: Option<i32>, output: String },

    #[error("Render exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn renderer '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Renderer reported success but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("Invalid source file: {0}")]
    InvalidSource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur when calling the upstream generation service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Missing API key: GENERATION_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Failed to parse upstream response: {0}")]
    InvalidResponse(String),

    #[error("Circuit '{0}' is open")]
    CircuitOpen(String),
}

impl GenerationError {
    /// Returns whether a failed call may succeed when repeated.
    ///
    /// An open circuit is deliberately not retryable: retrying inside the same
    /// call chain would only keep knocking on a breaker that is cooling down.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Upstream(_) | GenerationError::RateLimited(_)
        )
    }
}

/// Errors that can occur during output file storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Path '{0}' is outside the storage root")]
    OutsideRoot(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned to callers of the render service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Render queue is full, try again later")]
    QueueFull,

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Upstream service temporarily unavailable: {0}")]
    CircuitOpen(String),

    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// HTTP status code the transport layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::RateLimited { .. } => 429,
            ServiceError::Upstream(_) => 502,
            ServiceError::QueueFull | ServiceError::CircuitOpen(_) | ServiceError::Unavailable(_) => {
                503
            }
            ServiceError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ServiceError::QueueFull => "QUEUE_FULL",
            ServiceError::NotFound(_) => "JOB_NOT_FOUND",
            ServiceError::CircuitOpen(_) => "CIRCUIT_OPEN",
            ServiceError::Upstream(_) => "UPSTREAM_ERROR",
            ServiceError::Unavailable(_) => "SERVICE_UNAVAILABLE",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::RateLimited { .. }
                | ServiceError::QueueFull
                | ServiceError::CircuitOpen(_)
                | ServiceError::Unavailable(_)
        )
    }
}

impl From<GenerationError> for ServiceError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::CircuitOpen(name) => ServiceError::CircuitOpen(name),
            GenerationError::Rejected { message, .. } => ServiceError::Validation(message),
            other => ServiceError::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_status_codes() {
        assert_eq!(ServiceError::Validation("x".into()).http_status(), 400);
        assert_eq!(ServiceError::NotFound(Uuid::nil()).http_status(), 404);
        assert_eq!(
            ServiceError::RateLimited {
                message: "slow down".into(),
                retry_after: None
            }
            .http_status(),
            429
        );
        assert_eq!(ServiceError::QueueFull.http_status(), 503);
        assert_eq!(ServiceError::CircuitOpen("gen".into()).http_status(), 503);
        assert_eq!(ServiceError::Internal("boom".into()).http_status(), 500);
    }

    #[test]
    fn test_generation_error_retryable() {
        assert!(GenerationError::Upstream("reset".into()).is_retryable());
        assert!(GenerationError::RateLimited("429".into()).is_retryable());
        assert!(!GenerationError::CircuitOpen("gen".into()).is_retryable());
        assert!(!GenerationError::Rejected {
            code: 400,
            message: "bad prompt".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_generation_error_maps_to_service_error() {
        let err: ServiceError = GenerationError::CircuitOpen("gen".into()).into();
        assert!(matches!(err, ServiceError::CircuitOpen(_)));
        assert!(err.is_retryable());

        let err: ServiceError = GenerationError::Upstream("timeout".into()).into();
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::InvalidTransition {
            from: JobStatus::Ready,
            to: JobStatus::Rendering,
        };
        assert!(err.to_string().contains("'ready' to 'rendering'"));
    }
}
