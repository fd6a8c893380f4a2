//! CLI command definitions for render-forge.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::{export_metrics, init_metrics};
use crate::ratelimit::{EndpointLimit, RateLimitConfig};
use crate::registry::JobStatus;
use crate::scheduler::RenderQuality;
use crate::service::{RenderService, RenderStatus, RENDER_ENDPOINT};

/// Identity used for submissions made from the command line.
const CLI_IDENTITY: &str = "cli";

/// Render job orchestration with rate limiting, circuit breaking and cleanup.
#[derive(Parser)]
#[command(name = "render-forge")]
#[command(about = "Run render jobs on a bounded worker pool with pollable status")]
#[command(version)]
#[command(
    long_about = "render-forge schedules an external renderer (manim by default) against scene files,\nexposes pollable job status and cleans up expired jobs and outputs.\n\nConfiguration is read from RENDER_* and GENERATION_* environment variables.\n\nExample usage:\n  render-forge render scenes/intro.py --quality M"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Render scene files and print their final status as JSON.
    Render(RenderArgs),

    /// Run the render workers and periodic cleanup until interrupted.
    Serve(ServeArgs),

    /// Run one cleanup cycle and print the report as JSON.
    Cleanup(CleanupArgs),

    /// Print the effective rate-limit tiers as JSON.
    Limits(LimitsArgs),

    /// Print the Prometheus metrics exposition.
    Metrics,
}

/// Arguments for `render-forge render`.
#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Scene files to render.
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// Render quality (L, M or H).
    #[arg(short, long)]
    pub quality: Option<RenderQuality>,

    /// Render timeout in seconds.
    #[arg(short, long)]
    pub timeout_secs: Option<u64>,

    /// Directory for rendered files.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Number of render workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Renderer command line template.
    #[arg(long)]
    pub command: Option<String>,

    /// Interval between status polls in milliseconds.
    #[arg(long, default_value = "500")]
    pub poll_ms: u64,
}

/// Arguments for `render-forge serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Seconds between health log lines.
    #[arg(long, default_value = "60")]
    pub health_interval_secs: u64,
}

/// Arguments for `render-forge cleanup`.
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Retention age in hours (clamped to 1..=168).
    #[arg(long, default_value = "24")]
    pub max_age_hours: u64,

    /// Directory of rendered files.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

/// Arguments for `render-forge limits`.
#[derive(Parser, Debug)]
pub struct LimitsArgs {
    /// YAML file with rate-limit tiers.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Render(args) => run_render_command(args).await,
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Cleanup(args) => run_cleanup_command(args).await,
        Commands::Limits(args) => run_limits_command(args),
        Commands::Metrics => run_metrics_command(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{}", json);
    Ok(())
}

/// Registers metrics, tolerating a registry set up earlier in the process.
fn ensure_metrics() {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed");
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_render_command(args: RenderArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(quality) = args.quality {
        config.render_quality = quality;
    }
    if let Some(secs) = args.timeout_secs {
        config.render_timeout = Duration::from_secs(secs);
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(workers) = args.workers {
        config.pool_size = workers;
    }
    if let Some(command) = args.command {
        config.render_command = Some(command);
    }
    // A local batch is submitted by one identity; size its tier to the batch.
    let batch = u32::try_from(args.sources.len()).unwrap_or(u32::MAX);
    config.rate_limits = config
        .rate_limits
        .with_endpoint(RENDER_ENDPOINT, EndpointLimit::new(batch, 1));
    config.validate()?;

    for source in &args.sources {
        if !source.is_file() {
            anyhow::bail!("Source file not found: {}", source.display());
        }
    }

    ensure_metrics();
    let service = RenderService::from_config(&config)?;
    service.start().await?;

    let mut job_ids = Vec::with_capacity(args.sources.len());
    for source in &args.sources {
        let submitted = service.submit_render(CLI_IDENTITY, source.clone())?;
        info!(job_id = %submitted.job_id, source = %source.display(), "Submitted render");
        job_ids.push(submitted.job_id);
    }

    let poll_interval = Duration::from_millis(args.poll_ms.max(10));
    let statuses: Vec<RenderStatus> = loop {
        let statuses = job_ids
            .iter()
            .map(|id| service.poll_render(*id))
            .collect::<Result<Vec<_>, _>>()?;
        if statuses.iter().all(|s| s.status.is_terminal()) {
            break statuses;
        }
        tokio::time::sleep(poll_interval).await;
    };

    service.shutdown().await;
    print_json(&statuses)?;

    let failed = statuses
        .iter()
        .filter(|s| s.status == JobStatus::Error)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} renders failed", failed, statuses.len());
    }
    Ok(())
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    ensure_metrics();

    let service = RenderService::from_config(&config)?;
    service.start().await?;
    info!(
        workers = config.pool_size,
        output_dir = %config.output_dir.display(),
        "Serving; press Ctrl-C to stop"
    );

    let mut health_ticker =
        tokio::time::interval(Duration::from_secs(args.health_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = health_ticker.tick() => {
                let health = service.health();
                info!(
                    status = ?health.status,
                    issues = ?health.issues,
                    jobs = health.jobs.total_jobs,
                    queue_depth = health.pool.queue_depth,
                    "Health check"
                );
            }
        }
    }

    info!("Shutdown requested");
    service.shutdown().await;
    Ok(())
}

async fn run_cleanup_command(args: CleanupArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    ensure_metrics();
    let service = RenderService::from_config(&config)?;
    let report = service.cleanup_now(args.max_age_hours).await;
    print_json(&report)
}

fn run_limits_command(args: LimitsArgs) -> anyhow::Result<()> {
    let limits = match args.config {
        Some(path) => RateLimitConfig::load(path)?,
        None => Config::from_env()?.rate_limits,
    };
    limits.validate()?;
    print_json(&limits)
}

fn run_metrics_command() -> anyhow::Result<()> {
    ensure_metrics();
    print!("{}", export_metrics());
    Ok(())
}
