//! jobdesk: named job triggers and update checks
//!
//! Main binary with subcommands:
//! - `list`: show the jobs defined in a job file
//! - `trigger`: run one job by identifier and wait for the scheduler to drain
//! - `run`: run interval jobs until interrupted
//! - `check-update`: ask the release feed whether a newer version exists

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobdesk::config;
use jobdesk::{HttpUpdateChecker, UpdateService, VersionInfo};
use jobdesk_scheduler::{
    JobDispatcher, JobRegistry, JobSchedule, TokioScheduler, TriggerOutcome, TriggerPayload,
};

/// Parse a `KEY=VALUE` trigger parameter.
fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid parameter '{}', expected KEY=VALUE", s)),
    }
}

#[derive(Parser)]
#[command(name = "jobdesk")]
#[command(about = "Trigger named jobs and check for updates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the jobs defined in a job file
    List {
        /// Job file (JSON)
        #[arg(long, env = "JOBDESK_JOBS")]
        jobs: PathBuf,
    },

    /// Trigger one job by identifier
    Trigger {
        /// Job identifier (case-sensitive)
        #[arg(value_name = "ID")]
        id: String,

        /// Payload entry, repeatable
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Job file (JSON)
        #[arg(long, env = "JOBDESK_JOBS")]
        jobs: PathBuf,
    },

    /// Run interval jobs until Ctrl-C
    Run {
        /// Job file (JSON)
        #[arg(long, env = "JOBDESK_JOBS")]
        jobs: PathBuf,
    },

    /// Check the release feed for a newer version
    CheckUpdate {
        /// Version currently running
        #[arg(long, env = "JOBDESK_CURRENT_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
        current_version: String,

        /// Release branch to follow
        #[arg(long, env = "JOBDESK_BRANCH", default_value = "stable")]
        branch: String,

        /// Base URL of the release feed
        #[arg(long, env = "JOBDESK_FEED_URL")]
        feed_url: String,

        /// Request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jobdesk=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List { jobs } => list_jobs(&jobs).await,

        Commands::Trigger { id, params, jobs } => {
            trigger_job(&jobs, &id, params.into_iter().collect()).await
        }

        Commands::Run { jobs } => run_scheduler(&jobs).await,

        Commands::CheckUpdate {
            current_version,
            branch,
            feed_url,
            timeout_secs,
        } => {
            check_update(
                &feed_url,
                VersionInfo::new(current_version, branch),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

async fn load_registry(path: &Path) -> Result<Arc<JobRegistry>> {
    let registry = config::load_registry(path).await.into_diagnostic()?;
    info!(path = %path.display(), jobs = registry.len(), "loaded job file");
    Ok(Arc::new(registry))
}

async fn list_jobs(path: &Path) -> Result<()> {
    let registry = load_registry(path).await?;

    if registry.is_empty() {
        println!("No jobs defined.");
        return Ok(());
    }

    println!("Jobs:\n");
    for job in registry.iter() {
        let schedule = match job.schedule {
            JobSchedule::Manual => "manual".to_string(),
            JobSchedule::Interval { seconds } => format!("every {}s", seconds),
        };
        println!(
            "  {:<28} mode={:?} overlap={:?} schedule={}",
            job.id, job.mode, job.overlap, schedule
        );
    }

    Ok(())
}

async fn trigger_job(path: &Path, id: &str, payload: TriggerPayload) -> Result<()> {
    let registry = load_registry(path).await?;
    let scheduler = TokioScheduler::new();
    scheduler.start(&registry).await;
    let dispatcher = JobDispatcher::new(Arc::clone(&registry), Arc::new(scheduler.clone()));

    let payload = (!payload.is_empty()).then_some(payload);
    let result = dispatcher.trigger_by_name(id, payload).await;

    // Let accepted fire-and-forget runs finish before the process exits.
    scheduler.shutdown().await;

    match result.into_diagnostic()? {
        TriggerOutcome::Accepted { run_id } => println!("Accepted {} (run {})", id, run_id),
        TriggerOutcome::Completed { run_id } => println!("Completed {} (run {})", id, run_id),
    }

    if let Some(state) = scheduler.state(id).await {
        println!("Status: {:?}", state.status);
    }

    Ok(())
}

async fn run_scheduler(path: &Path) -> Result<()> {
    let registry = load_registry(path).await?;
    let scheduler = TokioScheduler::new();
    scheduler.start(&registry).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(Arc::clone(&registry), shutdown_rx).await;
    scheduler.shutdown().await;

    Ok(())
}

async fn check_update(feed_url: &str, current: VersionInfo, timeout: Duration) -> Result<()> {
    let checker = HttpUpdateChecker::new(feed_url, current, timeout).into_diagnostic()?;
    let service = UpdateService::new(Arc::new(checker));

    let available = service.check().await.into_diagnostic()?;
    println!("{}", available);

    Ok(())
}
