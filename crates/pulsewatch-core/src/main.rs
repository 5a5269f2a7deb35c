//! Pulsewatch CLI
//!
//! Command-line interface for the Pulsewatch check and alert pipeline.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pulsewatch::alerting::{AlertEvaluator, NotifierRegistry};
use pulsewatch::api::{AppState, HttpServer};
use pulsewatch::config::AlertDispatchMode;
use pulsewatch::db::{Datastore, PostgresPool, PostgresStore};
use pulsewatch::queue::{self, QueueService, QueueSettings};
use pulsewatch::scheduler::Scheduler;
use pulsewatch::worker::{AlertHandoff, CheckProcessor, HealthCheckExecutor, PipelineHandler, WorkerPool};
use pulsewatch::{telemetry, Config};
use tokio::sync::watch;
use tracing::{error, info};

/// Pulsewatch - queue-backed uptime checks and alerting
#[derive(Parser)]
#[command(name = "pulsewatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "PULSEWATCH_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Which configured queue a worker consumes
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum QueueRole {
    Priority,
    Bulk,
    Alerts,
    All,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop, every worker and the HTTP API
    Serve {
        /// HTTP API port
        #[arg(long, env = "PULSEWATCH_HTTP_PORT")]
        http_port: Option<u16>,

        /// Do not run the scheduler loop in this process
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Run one scheduling pass
    Schedule {
        /// Show what would be enqueued without claiming anything
        #[arg(long)]
        dry_run: bool,

        /// Override the configured batch limit
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Consume a queue until interrupted
    Worker {
        /// Queue to consume
        #[arg(long, value_enum, default_value = "all")]
        queue: QueueRole,
    },

    /// Show queue attributes
    Queues,

    /// Check database and queue connectivity
    Health,

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref().map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match telemetry::init_tracing(&config.logging, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Serve {
            http_port,
            no_scheduler,
        } => run_serve(config, http_port, no_scheduler).await,
        Commands::Schedule { dry_run, limit } => {
            run_schedule(config, dry_run, limit, cli.format).await
        }
        Commands::Worker { queue } => run_worker(config, queue).await,
        Commands::Queues => run_queues(config, cli.format).await,
        Commands::Health => run_health(config, cli.format).await,
        Commands::Db { command } => run_db(config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Clients shared by every component of one process
struct Runtime {
    config: Config,
    store: Arc<dyn Datastore>,
    queue: Arc<dyn QueueService>,
    scheduler: Arc<Scheduler>,
}

impl Runtime {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let pool = PostgresPool::new(&config.database)
            .await
            .context("failed to connect to the database")?;
        let store: Arc<dyn Datastore> = Arc::new(PostgresStore::new(&pool));
        let queue = queue::connect(&config)
            .await
            .context("failed to connect to the queue backend")?;
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            config.scheduler.clone(),
            config.queues.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue,
            scheduler,
        })
    }

    fn handler(&self) -> anyhow::Result<Arc<PipelineHandler>> {
        let notifiers = NotifierRegistry::from_config(&self.config.notifications)
            .context("invalid notification provider configuration")?;
        info!(channels = ?notifiers.kinds(), "Notification providers registered");

        let evaluator = AlertEvaluator::new(
            self.store.clone(),
            notifiers,
            self.config.alerting.history_window,
        );
        let executor = HealthCheckExecutor::new(&self.config.checks)?;
        let handoff = match self.config.alerting.dispatch {
            AlertDispatchMode::Queue => AlertHandoff::Queue {
                queue: self.queue.clone(),
                name: self.config.queues.alerts.name.clone(),
            },
            AlertDispatchMode::Task => AlertHandoff::Task,
        };
        let checks = CheckProcessor::new(self.store.clone(), executor, evaluator.clone(), handoff);

        Ok(Arc::new(PipelineHandler::new(
            checks,
            evaluator,
            self.scheduler.clone(),
            self.queue.clone(),
        )))
    }

    fn pools(&self, role: QueueRole) -> anyhow::Result<Vec<WorkerPool>> {
        let handler = self.handler()?;
        let queues = &self.config.queues;
        let selected: Vec<QueueSettings> = match role {
            QueueRole::Priority => vec![queues.priority.clone()],
            QueueRole::Bulk => vec![queues.bulk.clone()],
            QueueRole::Alerts => vec![queues.alerts.clone()],
            QueueRole::All => queues.all(),
        };

        Ok(selected
            .into_iter()
            .map(|settings| {
                WorkerPool::new(
                    self.queue.clone(),
                    handler.clone(),
                    settings,
                    self.config.worker.clone(),
                )
            })
            .collect())
    }
}

/// Flip the shutdown channel on Ctrl+C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutting down...");
        let _ = tx.send(true);
    });
    rx
}

async fn run_serve(config: Config, http_port: Option<u16>, no_scheduler: bool) -> anyhow::Result<()> {
    telemetry::install_metrics_exporter(&config.metrics)?;
    let runtime = Runtime::connect(config).await?;
    let shutdown = shutdown_on_ctrl_c();

    let mut tasks = Vec::new();

    if !no_scheduler {
        let scheduler = runtime.scheduler.clone();
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(rx).await }));
    }

    for pool in runtime.pools(QueueRole::All)? {
        let rx = shutdown.clone();
        tasks.push(tokio::spawn(async move { pool.run_forever(rx).await }));
    }

    let server = HttpServer::new(AppState {
        store: runtime.store.clone(),
        queue: runtime.queue.clone(),
        scheduler: runtime.scheduler.clone(),
        queues: runtime.config.queues.clone(),
    });
    let port = http_port.unwrap_or(runtime.config.server.http_port);
    let addr = format!("{}:{}", runtime.config.server.host, port);

    info!(addr = %addr, scheduler = !no_scheduler, "Pulsewatch started");
    let served = server.serve(&addr, shutdown).await;

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    served?;
    Ok(())
}

async fn run_schedule(
    config: Config,
    dry_run: bool,
    limit: Option<usize>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let runtime = Runtime::connect(config).await?;
    let limit = limit.unwrap_or(runtime.config.scheduler.batch_limit);

    if dry_run {
        let planned = runtime.scheduler.preview(limit).await?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&planned)?),
            OutputFormat::Text => {
                if planned.is_empty() {
                    println!("No monitors are due");
                }
                for check in &planned {
                    println!(
                        "{:<38} {:<10} {:<18} {}",
                        check.monitor_id,
                        check.priority.as_str(),
                        check.queue,
                        check.name
                    );
                }
            }
        }
        return Ok(());
    }

    let report = runtime.scheduler.schedule_with_limit(limit).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!(
            "Scheduled {} of {} due monitors ({} errors)",
            report.enqueued, report.total, report.errors
        ),
    }
    Ok(())
}

async fn run_worker(config: Config, role: QueueRole) -> anyhow::Result<()> {
    telemetry::install_metrics_exporter(&config.metrics)?;
    let runtime = Runtime::connect(config).await?;
    let shutdown = shutdown_on_ctrl_c();

    let tasks: Vec<_> = runtime
        .pools(role)?
        .into_iter()
        .map(|pool| {
            let rx = shutdown.clone();
            tokio::spawn(async move { pool.run_forever(rx).await })
        })
        .collect();

    for task in tasks {
        task.await.context("worker task panicked")?;
    }
    Ok(())
}

async fn run_queues(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    let queue = queue::connect(&config).await?;

    let mut rows = Vec::new();
    for settings in config.queues.all() {
        rows.push(queue.attributes(&settings.name).await?);
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            println!(
                "{:<20} {:>8} {:>10} {:>12} {:>8}",
                "QUEUE", "VISIBLE", "IN FLIGHT", "OLDEST", "DLQ"
            );
            for row in &rows {
                println!(
                    "{:<20} {:>8} {:>10} {:>12} {:>8}",
                    row.name,
                    row.depth,
                    row.in_flight,
                    row.oldest_age_seconds.map_or_else(
                        || "-".to_string(),
                        |age| humantime::format_duration(Duration::from_secs(age)).to_string()
                    ),
                    row.dead_lettered
                );
            }
        }
    }
    Ok(())
}

async fn run_health(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    let database = match PostgresPool::new(&config.database).await {
        Ok(pool) => pool.health_check().await.is_ok(),
        Err(_) => false,
    };
    let queue = match queue::connect(&config).await {
        Ok(queue) => queue.health_check().await.is_ok(),
        Err(_) => false,
    };

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "database": database, "queue": queue })
        ),
        OutputFormat::Text => {
            let mark = |ok: bool| if ok { "ok" } else { "unreachable" };
            println!("Database: {}", mark(database));
            println!("Queue:    {}", mark(queue));
        }
    }

    if database && queue {
        Ok(())
    } else {
        anyhow::bail!("one or more dependencies are unreachable")
    }
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    match command {
        DbCommands::Migrate => {
            let pool = PostgresPool::new(&config.database).await?;
            pool.migrate().await?;
            println!("Migrations applied");
        }
    }
    Ok(())
}
