mod config;

use clap::{Parser, Subcommand};
use conductor_bus::NatsBus;
use conductor_core::protocol::NewSchedule;
use conductor_orchestrator::{durable_subjects, Orchestrator};
use conductor_store::{
    ConnectionRepository, Repositories, ScheduleRepository, SqliteStore, TaskRepository,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ConductorConfig;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor agent fleet orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// SQLite database file (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until interrupted
    Serve {
        /// NATS server URL (overrides config)
        #[arg(long)]
        nats_url: Option<String>,
        /// Instance id used for schedule claims (overrides config)
        #[arg(long)]
        instance_id: Option<String>,
    },
    /// Manage recurring schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Show stored tasks
    Tasks {
        /// Only pending, assigned and running tasks
        #[arg(long)]
        active: bool,
        /// Only tasks fired by this schedule
        #[arg(long, conflicts_with = "active")]
        schedule: Option<String>,
        /// Maximum number of tasks to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the last known snapshot of every registered client
    Clients,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List schedules
    List,
    /// Add a schedule
    Add {
        name: String,
        prompt: String,
        /// Seconds between runs
        #[arg(long, default_value_t = 3600)]
        interval: u64,
        /// 7-field cron expression (overrides --interval)
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        start_url: Option<String>,
        /// Tasks per firing
        #[arg(long, default_value_t = 1)]
        parallel: u32,
        #[arg(long)]
        max_runs: Option<u32>,
        /// Notify every gateway when a run finishes
        #[arg(long)]
        notify: bool,
        #[arg(long)]
        self_learning: bool,
        #[arg(long)]
        self_healing: bool,
    },
    /// Delete a schedule
    Remove { schedule_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = ConductorConfig::load(&cli.config).await?;
    let db_path = cli.db.unwrap_or_else(|| config.store.path.clone());

    match cli.command {
        Commands::Serve {
            nats_url,
            instance_id,
        } => {
            if let Some(url) = nats_url {
                config.nats.url = url;
            }
            if let Some(id) = instance_id {
                config.orchestrator.instance_id = id;
            }

            let store = Arc::new(SqliteStore::open(&db_path)?);
            let subjects = config.orchestrator.subjects();
            let bus = NatsBus::connect(&config.nats, durable_subjects(&subjects)).await?;
            info!(
                nats = %config.nats.url,
                db = %db_path.display(),
                instance_id = %config.orchestrator.instance_id,
                "Starting Conductor"
            );

            let orchestrator = Orchestrator::new(
                config.orchestrator,
                Arc::new(bus),
                Repositories::from_store(store),
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutdown requested");
                        let _ = shutdown_tx.send(true);
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not install Ctrl-C handler");
                        std::future::pending::<()>().await;
                    }
                }
            });

            orchestrator.run(shutdown_rx).await?;
        }
        Commands::Schedule { action } => {
            let store = SqliteStore::open(&db_path)?;
            match action {
                ScheduleAction::List => {
                    let schedules = store.list_schedules().await?;
                    if schedules.is_empty() {
                        println!("No schedules.");
                    } else {
                        for s in &schedules {
                            let cadence = s
                                .cron_expression
                                .clone()
                                .unwrap_or_else(|| format!("every {}s", s.interval_seconds));
                            let next = s
                                .next_run_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "  {}  {} [{}] {} runs={} next={}",
                                s.schedule_id,
                                s.name,
                                if s.enabled { "enabled" } else { "disabled" },
                                cadence,
                                s.run_count,
                                next
                            );
                        }
                        println!("\nTotal: {} schedule(s)", schedules.len());
                    }
                }
                ScheduleAction::Add {
                    name,
                    prompt,
                    interval,
                    cron,
                    start_url,
                    parallel,
                    max_runs,
                    notify,
                    self_learning,
                    self_healing,
                } => {
                    let schedule = NewSchedule {
                        name,
                        prompt,
                        start_url,
                        interval_seconds: interval,
                        cron_expression: cron,
                        enabled: true,
                        options: Default::default(),
                        parallel_workers: parallel,
                        max_runs,
                        notify_on_complete: notify,
                        self_learning,
                        self_healing,
                        self_learning_max_runs: None,
                    }
                    .into_schedule()?;
                    store.create_schedule(&schedule).await?;
                    println!("Created schedule {} ({})", schedule.schedule_id, schedule.name);
                }
                ScheduleAction::Remove { schedule_id } => {
                    if store.delete_schedule(&schedule_id).await? {
                        println!("Deleted schedule {schedule_id}");
                    } else {
                        anyhow::bail!("Unknown schedule '{schedule_id}'");
                    }
                }
            }
        }
        Commands::Tasks {
            active,
            schedule,
            limit,
        } => {
            let store = SqliteStore::open(&db_path)?;
            let mut tasks = match (active, schedule) {
                (_, Some(schedule_id)) => store.list_tasks_by_schedule(&schedule_id).await?,
                (true, None) => store.list_active_tasks().await?,
                (false, None) => store.list_recent_tasks(limit).await?,
            };
            tasks.truncate(limit);
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                println!(
                    "  {}  {:<9} {:<9} worker={} {}",
                    task.task_id,
                    task.status.to_string(),
                    task.source.to_string(),
                    task.worker_id.as_deref().unwrap_or("-"),
                    task.created_at.to_rfc3339()
                );
            }
        }
        Commands::Clients => {
            let store = SqliteStore::open(&db_path)?;
            let clients = store.list_connections().await?;
            if clients.is_empty() {
                println!("No clients.");
            }
            for conn in &clients {
                println!(
                    "  {:<24} {:<10} {:<4} last_heartbeat={}",
                    conn.client_id,
                    conn.client_type.to_string(),
                    if conn.is_idle() { "idle" } else { "busy" },
                    conn.last_heartbeat.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
