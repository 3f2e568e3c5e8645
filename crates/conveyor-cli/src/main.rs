use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conveyor_core::ConveyorConfig;
use conveyor_scheduler::{
    JobStatus, JobStore, NewJob, Scheduler, SqliteJobStore, TracingEventSink, WorkRegistry,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod params;
mod works;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Multi-tenant job scheduler", long_about = None)]
struct Cli {
    /// Path to the TOML config (default: $CONVEYOR_CONFIG or ~/.conveyor/conveyor.toml).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler with the built-in work types until Ctrl-C.
    Run,
    Submit {
        #[arg(long)]
        tenant: String,
        #[arg(long = "type")]
        job_type: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Job parameter as `name=<json>`; bare words are taken as strings.
        #[arg(long = "param", action = clap::ArgAction::Append)]
        params: Vec<String>,
        /// Keep the job pending for this many seconds.
        #[arg(long)]
        trigger_in_secs: Option<i64>,
        /// Fail the job if it has not started within this many seconds.
        #[arg(long)]
        expire_in_secs: Option<i64>,
    },
    Cancel {
        job_id: String,
    },
    Show {
        job_id: String,
    },
    List {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "queued")]
        status: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info,conveyor_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > CONVEYOR_CONFIG env > ~/.conveyor/conveyor.toml
    let config_path = cli.config.or_else(|| std::env::var("CONVEYOR_CONFIG").ok());
    let config = ConveyorConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        ConveyorConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(db_path).with_context(|| format!("opening job store at {db_path}"))?,
    );

    match cli.command {
        Commands::Run => run(store, config).await,
        Commands::Submit {
            tenant,
            job_type,
            priority,
            params,
            trigger_in_secs,
            expire_in_secs,
        } => {
            let scheduler = control_plane(store, config);
            let now = chrono::Utc::now();
            let mut job = NewJob::new(tenant, job_type)
                .with_priority(priority)
                .with_parameters(params::parse_all(&params)?);
            if let Some(secs) = trigger_in_secs {
                job = job.triggered_at(now + chrono::Duration::seconds(secs));
            }
            if let Some(secs) = expire_in_secs {
                job = job.expires_at(now + chrono::Duration::seconds(secs));
            }
            let id = scheduler.submit(job)?;
            println!("{id}");
            Ok(())
        }
        Commands::Cancel { job_id } => {
            let job = control_plane(store, config).cancel(&job_id)?;
            print_json(&job)
        }
        Commands::Show { job_id } => {
            let job = control_plane(store, config).query(&job_id)?;
            print_json(&job)
        }
        Commands::List { tenant, status } => {
            let status: JobStatus = status.parse()?;
            let jobs = control_plane(store, config).query_by_status(&tenant, status)?;
            print_json(&jobs)
        }
    }
}

async fn run(store: Arc<dyn JobStore>, config: ConveyorConfig) -> Result<()> {
    let registry = works::builtin_registry();
    info!(job_types = ?registry.job_types(), "starting scheduler");
    let scheduler = Arc::new(Scheduler::new(
        store,
        registry,
        Arc::new(TracingEventSink),
        config.jobs,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received — stopping");
    let _ = shutdown_tx.send(true);
    engine.await.context("scheduler task failed")?;
    Ok(())
}

/// A scheduler without work types, used by one-shot commands to reach the
/// store through the same transitions the daemon uses.
fn control_plane(store: Arc<dyn JobStore>, config: ConveyorConfig) -> Scheduler {
    Scheduler::new(store, WorkRegistry::new(), Arc::new(TracingEventSink), config.jobs)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
