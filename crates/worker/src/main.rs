//! `clipper-worker`: inspect and manage jobs in the local job database.

use anyhow::Context;
use clap::Parser;
use clipper_core::job::{JobFilter, JobStatus, JobType};
use clipper_core::job_store::{cancel_job, list_all, JobStore};
use clipper_db::SqliteJobStore;
use clipper_worker::WorkerConfig;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "clipper-worker")]
#[command(version)]
#[command(about = "Inspect and manage Clipper generation jobs")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List jobs, newest first
    List {
        /// Only jobs with this status (queued, running, done, error, cancelled)
        #[arg(long)]
        status: Option<JobStatus>,

        /// Only jobs of this type
        #[arg(long = "type")]
        job_type: Option<JobType>,

        /// Maximum number of jobs (capped at 100)
        #[arg(long)]
        limit: Option<u32>,

        /// Skip this many of the newest matching jobs
        #[arg(long)]
        offset: Option<u32>,
    },

    /// Show a single job
    Show {
        /// Job ID
        id: Uuid,
    },

    /// Cancel a queued or running job
    Cancel {
        /// Job ID
        id: Uuid,
    },

    /// Report jobs left `running` by a worker that is gone
    Audit,
}

/// Line emitted by `audit` for each job with an unknown outcome.
#[derive(Serialize)]
struct IndeterminateJob<'a> {
    job_id: Uuid,
    job_type: JobType,
    stage: &'a str,
    progress_pct: u8,
    outcome: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clipper_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = WorkerConfig::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let pool = clipper_db::create_pool(&config.database_url())
        .await
        .context("opening job database")?;
    clipper_db::run_migrations(&pool)
        .await
        .context("running migrations")?;
    clipper_db::health_check(&pool)
        .await
        .context("job database health check")?;
    tracing::debug!(db = %config.db_path.display(), "Job database ready");

    let store = SqliteJobStore::new(pool);

    match args.command {
        Commands::List {
            status,
            job_type,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                status,
                job_type,
                limit,
                offset,
            };
            for job in store.list(&filter).await? {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
        Commands::Show { id } => match store.get(id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => anyhow::bail!("job {id} not found"),
        },
        Commands::Cancel { id } => match cancel_job(&store, id).await? {
            Some(outcome) => println!("{}", serde_json::to_string(&outcome)?),
            None => anyhow::bail!("job {id} not found"),
        },
        Commands::Audit => {
            // No worker runs inside this process, so every `running` row
            // belongs to a pool that stopped or crashed mid-job.
            let running = list_all(&store, &JobFilter::with_status(JobStatus::Running)).await?;
            if running.is_empty() {
                tracing::info!("No indeterminate jobs");
            }
            for job in &running {
                let line = IndeterminateJob {
                    job_id: job.id,
                    job_type: job.job_type,
                    stage: &job.stage,
                    progress_pct: job.progress_pct,
                    outcome: "indeterminate",
                };
                println!("{}", serde_json::to_string(&line)?);
            }
        }
    }

    Ok(())
}
