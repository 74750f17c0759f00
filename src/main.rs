use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use code_index_jobs::config::{
    AppConfig, CliConfig, FileConfig, DEFAULT_MAINTENANCE_INTERVAL_MINUTES,
    DEFAULT_RETENTION_HOURS,
};
use code_index_jobs::maintenance::{run_startup_recovery, spawn_retention_loop};
use code_index_jobs::{JobQuery, JobStatus, JobTracker, SqliteJobStore, TimeFilter};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::parse(s).ok_or_else(|| format!("unknown job status '{}'", s))
}

#[derive(Parser, Debug)]
#[clap(version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH")))]
struct CliArgs {
    /// Path to the SQLite database holding the background job table.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to a TOML config file. Values there override the CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Minutes between retention sweeps in `maintain` mode.
    #[clap(long, default_value_t = DEFAULT_MAINTENANCE_INTERVAL_MINUTES)]
    pub maintenance_interval_minutes: u64,

    /// Hours to keep finished jobs of operation types without their own retention.
    #[clap(long, default_value_t = DEFAULT_RETENTION_HOURS)]
    pub default_retention_hours: u64,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mark jobs left pending/running by a crashed server as failed.
    RecoverOrphans,

    /// Delete old finished jobs. Without arguments, applies the configured policy.
    Cleanup {
        #[clap(long, requires = "max_age_hours")]
        operation_type: Option<String>,
        #[clap(long, requires = "operation_type")]
        max_age_hours: Option<u64>,
    },

    /// List recent jobs (1h, 24h, 7d, 30d or all).
    Recent {
        #[clap(long, default_value_t = 50)]
        limit: usize,
        #[clap(long, default_value = "24h")]
        time_filter: TimeFilter,
    },

    /// Browse job history with optional filters.
    Query {
        #[clap(long)]
        operation_type: Option<String>,
        #[clap(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[clap(long)]
        repo_alias: Option<String>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show a single job.
    Show { job_id: String },

    /// Job counts per status.
    Stats,

    /// Recover orphans, then run retention sweeps until interrupted.
    Maintain,
}

#[derive(Serialize)]
struct JobStats {
    tracked_running: usize,
    tracked_pending: usize,
    stored: std::collections::BTreeMap<String, usize>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        maintenance_interval_minutes: cli_args.maintenance_interval_minutes,
        default_retention_hours: cli_args.default_retention_hours,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening job database at {:?}...", config.db_path);
    let store = Arc::new(SqliteJobStore::new(&config.db_path)?);
    let tracker = Arc::new(JobTracker::new(store));

    match cli_args.command {
        Command::RecoverOrphans => {
            let count = run_startup_recovery(&tracker)?;
            print_json(&serde_json::json!({ "orphaned_jobs_failed": count }))?;
        }
        Command::Cleanup {
            operation_type: Some(operation_type),
            max_age_hours: Some(max_age_hours),
        } => {
            let deleted = tracker.cleanup_old_jobs(&operation_type, max_age_hours)?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
        Command::Cleanup { .. } => {
            let deleted = tracker.cleanup_old_jobs_all(&config.retention)?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
        Command::Recent { limit, time_filter } => {
            print_json(&tracker.get_recent_jobs(limit, time_filter)?)?;
        }
        Command::Query {
            operation_type,
            status,
            repo_alias,
            limit,
        } => {
            let query = JobQuery {
                operation_type,
                status,
                repo_alias,
            };
            print_json(&tracker.query_jobs(&query, limit)?)?;
        }
        Command::Show { job_id } => {
            let job = tracker
                .get_job(&job_id)?
                .with_context(|| format!("Job {} not found", job_id))?;
            print_json(&job)?;
        }
        Command::Stats => {
            let stats = JobStats {
                tracked_running: tracker.get_active_job_count(),
                tracked_pending: tracker.get_pending_job_count(),
                stored: tracker
                    .stored_status_counts()?
                    .into_iter()
                    .map(|(status, count)| (status.as_str().to_string(), count))
                    .collect(),
            };
            print_json(&stats)?;
        }
        Command::Maintain => {
            run_startup_recovery(&tracker)?;

            let shutdown = CancellationToken::new();
            let retention_task = spawn_retention_loop(
                tracker.clone(),
                config.retention.clone(),
                config.maintenance_interval,
                shutdown.clone(),
            );

            info!("Maintenance running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down...");
            shutdown.cancel();
            retention_task.await?;
        }
    }

    Ok(())
}
