//! render-forge: render job orchestration and resilience engine.
//!
//! Accepts code artifacts, renders them with an external process on a bounded
//! worker pool and exposes pollable job status, while protecting itself and
//! its upstream generation service with rate limiting, circuit breaking,
//! retry with backoff and periodic cleanup.

// Core modules
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod ratelimit;
pub mod registry;
pub mod resilience;
pub mod resources;
pub mod scheduler;
pub mod service;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use error::{GenerationError, RegistryError, RenderError, ServiceError, StorageError};
pub use registry::{Job, JobId, JobRegistry, JobStatus};
pub use service::RenderService;
