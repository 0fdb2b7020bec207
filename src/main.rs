use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;
use xcluster_ctl::remote::SnapshotCatalog;
use xcluster_ctl::store::{ConfigRepository, FileStore, TaskStore};
use xcluster_ctl::task::{Orchestrator, StepRegistry};
use xcluster_ctl::xcluster::{load_snapshot, steps, TableStatus};
use xcluster_ctl::Config;

#[derive(Parser, Debug)]
#[command(name = "xcluster-ctl")]
#[command(about = "Inspect xCluster replication configs and tasks", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List replication configs
    List,
    /// Show a config with reconciled table statuses
    Show { config_id: Uuid },
    /// List a config's tables, optionally filtered by status
    Tables {
        config_id: Uuid,
        #[arg(long)]
        status: Option<TableStatus>,
    },
    /// List tasks
    Tasks {
        #[arg(long, help = "Only tasks that have not finished")]
        incomplete: bool,
    },
    /// Show a task with its subtasks
    Task { task_id: Uuid },
    /// Mark a stranded task as aborted
    Abort { task_id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("loading configuration");
        }
    };

    let store = Arc::new(
        FileStore::open(&config.store.state_dir)
            .await
            .with_context(|| format!("opening state directory {:?}", config.store.state_dir))?,
    );

    match args.command {
        Command::List => {
            for c in store.list().await? {
                println!("{}  {:<16} {:<15} tables={}", c.id, c.name, c.status, c.table_ids.len());
            }
        }
        Command::Show { config_id } => {
            let catalog = snapshot_catalog(&config)?;
            let record = store
                .get(config_id)
                .await?
                .with_context(|| format!("config {} not found", config_id))?;
            let snapshot = load_snapshot(&catalog, &record).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Tables { config_id, status } => {
            let catalog = snapshot_catalog(&config)?;
            let record = store
                .get(config_id)
                .await?
                .with_context(|| format!("config {} not found", config_id))?;
            let snapshot = load_snapshot(&catalog, &record).await?;
            for table in snapshot
                .tables
                .iter()
                .filter(|t| status.map_or(true, |s| t.status == s))
            {
                println!(
                    "{:<12} {:<12} {:<24} {:<20} {}",
                    table.table_id,
                    table.keyspace,
                    table.name,
                    table.status,
                    table.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Tasks { incomplete } => {
            let mut tasks = if incomplete {
                store.list_incomplete().await?
            } else {
                store.list_tasks().await?
            };
            tasks.sort_by_key(|t| t.created_at);
            for task in tasks {
                let done = task
                    .subtasks
                    .iter()
                    .filter(|s| s.state == xcluster_ctl::task::TaskState::Success)
                    .count();
                println!(
                    "{}  {:<16} {:<8} {}/{}  {}",
                    task.id,
                    task.kind,
                    task.state,
                    done,
                    task.subtasks.len(),
                    task.error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Task { task_id } => {
            let task = store
                .get_task(task_id)
                .await?
                .with_context(|| format!("task {} not found", task_id))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Command::Abort { task_id } => {
            // Nothing runs in this process, so the task is marked directly
            // and its config failed here rather than by a registered hook.
            let orchestrator =
                Orchestrator::new(StepRegistry::<()>::new(), store.clone(), Arc::new(()));
            orchestrator.abort(task_id).await?;
            let task = store
                .get_task(task_id)
                .await?
                .with_context(|| format!("task {} not found", task_id))?;
            steps::record_failure(store.as_ref(), &task).await?;
            info!(task_id = %task_id, "Task marked aborted");
        }
    }

    Ok(())
}

fn snapshot_catalog(config: &Config) -> anyhow::Result<SnapshotCatalog> {
    match SnapshotCatalog::from_config(config) {
        Some(catalog) => Ok(catalog),
        None => bail!("store.snapshot_dir must be set to reconcile table status"),
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("xcluster_ctl=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xcluster_ctl=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
