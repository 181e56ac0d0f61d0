use std::sync::Arc;

use agentcron_core::config::{AgentcronConfig, JobConfig};
use agentcron_core::AgentcronError;
use agentcron_scheduler::{
    Dispatcher, JobDefinition, RandomJitter, ScheduleState, Scheduler, SchedulerStore, SqliteStore,
    SystemClock, TransitionOutcome,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

mod executor;

/// agentcron - cron scheduler for recurring agent runs
#[derive(Parser)]
#[command(name = "agentcron")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $AGENTCRON_CONFIG, then ~/.agentcron/agentcron.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop and dispatcher until Ctrl-C
    Run,
    /// Reconcile every enabled job once and print the report
    Reconcile,
    /// List enabled jobs whose next occurrence has elapsed
    Due,
    /// List runs not yet handed to an executor
    Pending,
    /// List job definitions with their schedule state
    Jobs,
    /// Ask admission whether a new run of a job may start now
    Admit {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
    /// Cancel an active run
    Cancel {
        #[arg(value_name = "RUN_ID")]
        run_id: String,
    },
    /// Create a run of a job for right now
    RunNow {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
    /// Disable a job
    Pause {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
    /// Re-enable a job and reschedule it
    Resume {
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
}

#[derive(Serialize)]
struct JobView {
    job: JobDefinition,
    schedule: Option<ScheduleState>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentcron=info,agentcron_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // load config: --config > AGENTCRON_CONFIG env > ~/.agentcron/agentcron.toml
    let config_path = cli.config.or_else(|| std::env::var("AGENTCRON_CONFIG").ok());
    let config = AgentcronConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        AgentcronConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(SqliteStore::new(db)?);

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        &config.scheduler,
        Arc::new(SystemClock),
        Arc::new(RandomJitter),
    )?);
    seed_jobs(store.as_ref(), config.jobs).await?;

    let buffer = config.scheduler.dispatch_buffer;
    if let Err(e) = dispatch(cli.command, scheduler, store, buffer).await {
        let report = serde_json::json!({ "error": e.code(), "message": e.to_string() });
        eprintln!("{report}");
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(
    command: Commands,
    scheduler: Arc<Scheduler>,
    store: Arc<SqliteStore>,
    dispatch_buffer: usize,
) -> Result<(), AgentcronError> {
    match command {
        Commands::Run => run(scheduler, store, dispatch_buffer).await?,
        Commands::Reconcile => print(&scheduler.engine().update_all_schedules().await?)?,
        Commands::Due => print(&scheduler.engine().get_due_jobs().await?)?,
        Commands::Pending => print(&scheduler.lifecycle().get_pending_runs().await?)?,
        Commands::Jobs => {
            let mut views = Vec::new();
            for job in store.list_jobs().await? {
                let schedule = store.get_schedule(&job.id).await?;
                views.push(JobView { job, schedule });
            }
            print(&views)?;
        }
        Commands::Admit { job_id } => {
            let job = store
                .get_job(&job_id)
                .await?
                .ok_or(AgentcronError::JobNotFound { id: job_id })?;
            print(&scheduler.admission().can_run_job(&job).await?)?;
        }
        Commands::Cancel { run_id } => match scheduler.lifecycle().cancel_run(&run_id).await? {
            TransitionOutcome::NotFound => return Err(AgentcronError::RunNotFound { id: run_id }),
            outcome => print(&outcome)?,
        },
        Commands::RunNow { job_id } => print(&scheduler.run_now(&job_id).await?)?,
        Commands::Pause { job_id } => print(&scheduler.pause(&job_id).await?)?,
        Commands::Resume { job_id } => print(&scheduler.resume(&job_id).await?)?,
    }
    Ok(())
}

async fn run(
    scheduler: Arc<Scheduler>,
    store: Arc<SqliteStore>,
    dispatch_buffer: usize,
) -> Result<(), AgentcronError> {
    // Fired-run channel: scheduler tick loop → dispatcher
    let (fired_tx, fired_rx) = tokio::sync::mpsc::channel(dispatch_buffer.max(1));
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        scheduler.lifecycle().clone(),
        scheduler.admission().clone(),
        scheduler.locks().clone(),
        scheduler.in_flight().clone(),
        Arc::new(executor::LogExecutor),
    ));
    let dispatcher_task = tokio::spawn(dispatcher.run(fired_rx));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx, Some(fired_tx)));
    info!(version = env!("CARGO_PKG_VERSION"), "agentcron running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // The scheduler owns the only sender; once it stops the dispatcher
    // finishes the runs it already holds.
    scheduler_task
        .await
        .map_err(|e| AgentcronError::Internal(format!("scheduler task: {e}")))?;
    dispatcher_task
        .await
        .map_err(|e| AgentcronError::Internal(format!("dispatcher task: {e}")))?;
    Ok(())
}

/// Write config-declared jobs into the store.
///
/// New jobs are inserted as configured. A stored job whose definition changed
/// is replaced but keeps its `enabled` flag, so pause/resume survive restarts.
async fn seed_jobs(store: &dyn SchedulerStore, jobs: Vec<JobConfig>) -> anyhow::Result<()> {
    for cfg in jobs {
        let mut job = JobDefinition::from(cfg);
        match store.get_job(&job.id).await? {
            None => {
                store.save_job(&job).await?;
                info!(job_id = %job.id, "job seeded from config");
            }
            Some(existing) if existing.same_definition(&job) => {}
            Some(existing) => {
                job.enabled = existing.enabled;
                job.created_at = existing.created_at;
                store.save_job(&job).await?;
                info!(job_id = %job.id, "job definition updated from config");
            }
        }
    }
    Ok(())
}

fn print<T: Serialize>(value: &T) -> Result<(), AgentcronError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcron_scheduler::MemoryStore;

    fn config_job(schedule: &str) -> JobConfig {
        serde_json::from_value(serde_json::json!({
            "id": "digest",
            "schedule": schedule,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn seeding_keeps_operator_pause() {
        let store = MemoryStore::new();
        seed_jobs(&store, vec![config_job("0 8 * * *")]).await.unwrap();
        let first = store.get_job("digest").await.unwrap().unwrap();
        assert!(first.enabled);

        let mut paused = first.clone();
        paused.enabled = false;
        store.save_job(&paused).await.unwrap();

        // Unchanged definition: nothing rewritten.
        seed_jobs(&store, vec![config_job("0 8 * * *")]).await.unwrap();
        let same = store.get_job("digest").await.unwrap().unwrap();
        assert_eq!(same.updated_at, first.updated_at);
        assert!(!same.enabled);

        // Changed definition: replaced, still paused.
        seed_jobs(&store, vec![config_job("0 9 * * *")]).await.unwrap();
        let edited = store.get_job("digest").await.unwrap().unwrap();
        assert_eq!(edited.schedule, "0 9 * * *");
        assert_eq!(edited.created_at, first.created_at);
        assert!(edited.updated_at >= first.updated_at);
        assert!(!edited.enabled);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["agentcron", "run-now", "digest"]).unwrap();
        assert!(matches!(cli.command, Commands::RunNow { job_id } if job_id == "digest"));

        let cli = Cli::try_parse_from(["agentcron", "--config", "x.toml", "pending"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(Cli::try_parse_from(["agentcron", "explode"]).is_err());
    }
}
