//! Command-line interface for render-forge.
//!
//! Provides commands for rendering scene files, running the service, one-off
//! cleanup and inspecting rate limits and metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
