use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use cadence_core::config::CadenceConfig;
use cadence_scheduler::{JobStore, SchedulerEngine, SqliteStore};

mod jobs;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Persistent, priority-aware job scheduler")]
#[command(version)]
struct Cli {
    /// Config file (falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,

    /// List loaded jobs and their stored status
    ListJobs,

    /// List queues in dispatch order
    ListQueues,

    /// List scheduled entries by next run time
    Upcoming,

    /// Show recent runs, newest first
    History {
        /// Only runs of this job
        #[arg(short, long)]
        job: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_cli=info,cadence_scheduler=info,cadence_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).context("loading configuration")?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(
        SqliteStore::open(db_path).with_context(|| format!("opening database {db_path}"))?,
    );

    let registry = jobs::registry()?;
    let engine = SchedulerEngine::new(config.scheduler.clone(), store.clone(), registry)?;

    match cli.command {
        Command::Run => run(&engine).await,
        Command::ListJobs => list_jobs(&engine, store.as_ref()).await,
        Command::ListQueues => {
            list_queues(&engine);
            Ok(())
        }
        Command::Upcoming => upcoming(store.as_ref()).await,
        Command::History { job, limit } => history(store.as_ref(), job.as_deref(), limit).await,
    }
}

async fn run(engine: &SchedulerEngine) -> anyhow::Result<()> {
    engine.start().await?;
    info!("cadence scheduler started; press Ctrl-C to exit");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    engine.stop().await;
    Ok(())
}

async fn list_jobs(engine: &SchedulerEngine, store: &dyn JobStore) -> anyhow::Result<()> {
    let registry = engine.registry();
    if registry.is_empty() {
        println!("No jobs loaded.");
        return Ok(());
    }

    println!("{:<24} {:<10} {:<10} {:<12} LAST RUN", "JOB", "QUEUE", "STATUS", "RESCHEDULE");
    for job in registry.iter() {
        let def = store.get_job_definition(job.name()).await?;
        let status = def
            .as_ref()
            .map_or_else(|| "-".to_string(), |d| d.status.to_string());
        let last_run = def
            .and_then(|d| d.last_run_at)
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
        let reschedule = job
            .reschedule_delay()
            .filter(|_| job.reschedule())
            .map_or_else(|| "once".to_string(), |d| format!("{}ms", d.as_millis()));
        println!(
            "{:<24} {:<10} {:<10} {:<12} {}",
            job.name(),
            job.queue(),
            status,
            reschedule,
            last_run
        );
    }
    Ok(())
}

fn list_queues(engine: &SchedulerEngine) {
    println!("{:<12} {:>8} {:>6}", "QUEUE", "PRIORITY", "JOBS");
    for stats in engine.queue_stats() {
        let jobs = engine
            .registry()
            .iter()
            .filter(|job| job.queue() == stats.name)
            .count();
        println!("{:<12} {:>8} {:>6}", stats.name, stats.priority, jobs);
    }
}

async fn upcoming(store: &dyn JobStore) -> anyhow::Result<()> {
    let entries = store.list_scheduled_entries().await?;
    if entries.is_empty() {
        println!("No scheduled jobs found.");
        return Ok(());
    }
    for entry in entries {
        println!("{:<24} next at {}", entry.job_name, entry.next_run_at.to_rfc3339());
    }
    Ok(())
}

async fn history(store: &dyn JobStore, job: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let runs = store.list_job_runs(job, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:>6} {:<24} {:<9} {:>8} {:<32} ERROR",
        "ID", "JOB", "STATUS", "ATTEMPTS", "FINISHED"
    );
    for run in runs {
        let finished = run
            .finished_at
            .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
        println!(
            "{:>6} {:<24} {:<9} {:>8} {:<32} {}",
            run.id,
            run.job_name,
            run.status.to_string(),
            run.attempts,
            finished,
            run.error.unwrap_or_default()
        );
    }
    Ok(())
}

/// Create the database's parent directory if it doesn't exist.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
