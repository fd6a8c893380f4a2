//! Render scheduling with a bounded worker pool.
//!
//! This module turns submitted source artifacts into rendered files:
//!
//! - **WorkQueue**: in-process FIFO of job ids with a depth ceiling
//! - **RenderScheduler**: creates jobs and runs the worker pool
//! - **Renderer**: adapter trait over the external rendering engine
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Submitter  │
//!                      │ (service/CLI)│
//!                      └──────┬───────┘
//!                             │ create (queued)
//!                      ┌──────▼───────┐        ┌─────────────┐
//!                      │  WorkQueue   │        │ JobRegistry │
//!                      └──────┬───────┘        └──────▲──────┘
//!                             │                       │ transitions
//!         ┌───────────────────┼───────────────────┐   │
//!         ▼                   ▼                   ▼   │
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│──► Renderer
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use render_forge::registry::JobRegistry;
//! use render_forge::scheduler::{ProcessRenderer, RenderScheduler, SchedulerConfig};
//!
//! let registry = Arc::new(JobRegistry::new());
//! let scheduler = RenderScheduler::new(
//!     SchedulerConfig::new(2).with_output_dir("storage/videos"),
//!     Arc::clone(&registry),
//!     Arc::new(ProcessRenderer::manim()),
//! );
//! scheduler.start().await?;
//!
//! let job_id = scheduler.submit("storage/code/intro.py")?;
//! // poll registry.get(job_id) until ready or error
//!
//! scheduler.shutdown().await?;
//! ```

pub mod queue;
pub mod renderer;
pub mod worker_pool;

pub use queue::{QueueError, WorkQueue};
pub use renderer::{extract_scene_class, ProcessRenderer, RenderQuality, Renderer};
pub use worker_pool::{
    sanitize_error_message, PoolStats, RenderScheduler, SchedulerConfig, SchedulerError, Worker,
    INTERNAL_FAILURE_MESSAGE, RENDER_TIMEOUT_MESSAGE,
};
