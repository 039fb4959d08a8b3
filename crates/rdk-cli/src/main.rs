use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rdk_adapters::{AppStoreClient, HttpConfig, PlayStoreClient};
use rdk_pipeline::{Pipeline, Repository};
use rdk_store::open_store_from_env;
use rdk_web::AppState;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "rdk-cli")]
#[command(about = "Reviewdeck command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web surface, with the cron scheduler if enabled.
    Serve,
    /// Evaluate per-source due-ness for every app and ingest where due.
    Schedule,
    /// Ingest one registered app now.
    Scrape {
        app_id: String,
        /// Fetch up to the full per-source volume cap instead of the
        /// normal incremental cap.
        #[arg(long)]
        full: bool,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn build_pipeline() -> Result<Arc<Pipeline>> {
    let repo = Repository::new(open_store_from_env());
    let http = HttpConfig::from_env();
    let app_source = AppStoreClient::new(&http).context("building app store client")?;
    let play_source = PlayStoreClient::new(&http).context("building play store client")?;
    Ok(Arc::new(Pipeline::new(
        repo,
        Arc::new(app_source),
        Arc::new(play_source),
    )))
}

fn scheduler_enabled() -> bool {
    std::env::var("RDK_SCHEDULER_ENABLED")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

async fn maybe_start_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !scheduler_enabled() {
        return Ok(None);
    }
    let cron = std::env::var("RDK_SCHEDULE_CRON").unwrap_or_else(|_| "0 0 * * * *".to_string());
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_due_tasks().await {
                Ok(summary) => info!(
                    apps_checked = summary.apps_checked,
                    tasks_run = summary.tasks_run,
                    reviews_added = summary.reviews_added,
                    failures = summary.failures,
                    "scheduled run complete"
                ),
                Err(err) => warn!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "cron scheduler running");
    Ok(Some(sched))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let pipeline = build_pipeline()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let _sched = maybe_start_scheduler(pipeline.clone()).await?;
            rdk_web::serve_from_env(AppState::new(pipeline)).await?;
        }
        Commands::Schedule => {
            let summary = pipeline.run_due_tasks().await?;
            println!(
                "schedule run complete: checked={} ran={} added={} failed={}",
                summary.apps_checked, summary.tasks_run, summary.reviews_added, summary.failures
            );
        }
        Commands::Scrape { app_id, full } => {
            let outcome = pipeline.ingest(&app_id, full).await?;
            println!(
                "ingestion complete: app={} candidates={} added={}",
                outcome.app_id, outcome.candidates, outcome.reviews_added
            );
        }
    }

    Ok(())
}
