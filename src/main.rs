use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nodepulse::config::{AppConfig, LoggingConfig};
use nodepulse::scheduler::{self, SchedulerError, Task, TaskType, Trigger};
use nodepulse::status::NodeStatus;
use nodepulse::subscription::Subscription;
use nodepulse::App;

#[derive(Parser)]
#[command(
    name = "nodepulse",
    about = "Scheduled refresh and health probing for proxy-node subscription pools",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $NODEPULSE_CONFIG, then /etc/nodepulse/nodepulse.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + probes) and run until Ctrl-C
    Serve,

    /// Probe every stored node once and save the results
    TestNodes {
        /// Node tests in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Drop nodes slower than this before the speed test (ms)
        #[arg(long)]
        max_latency: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show node counters and task state
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage scheduled tasks
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Manage subscriptions
    Subscription {
        #[command(subcommand)]
        action: SubscriptionAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all tasks
    List,

    /// Add a new task
    Add {
        /// Task name
        #[arg(long)]
        name: String,

        /// Cron expression (6-field, seconds first)
        #[arg(long)]
        cron: String,

        /// Task type: subscription-refresh or node-test
        #[arg(long = "type")]
        task_type: String,

        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Store the task without scheduling it
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a task
    Remove {
        /// Task id
        #[arg(long)]
        id: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Run a task once, now
    Run {
        /// Task id
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum SubscriptionAction {
    /// List subscriptions
    List,

    /// Register a subscription URL
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        url: String,
    },

    /// Remove a subscription (its nodes stay in the pool)
    Remove {
        #[arg(long)]
        id: String,
    },

    /// Refresh every subscription now
    Refresh,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting nodepulse daemon");
            nodepulse::serve(config).await?;
        }
        Commands::TestNodes {
            concurrency,
            max_latency,
            json,
        } => {
            let app = App::open(config)?;
            app.persister.restore().await?;

            let mut probe = app.config.probe.to_probe_config();
            if let Some(c) = concurrency {
                probe.concurrency = c;
            }
            if let Some(ms) = max_latency {
                probe.max_latency_ms = ms;
            }

            let mut progress = app.engine.subscribe_progress();
            let watcher = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let p = *progress.borrow_and_update();
                    tracing::debug!(completed = p.completed, total = p.total, percent = p.percent, "Probe progress");
                }
            });

            let result = app.engine.test_nodes(&probe).await?;
            watcher.abort();
            app.persister.save().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\nnodepulse Node Test");
                println!("{:<16} : {}", "Total", result.total);
                println!("{:<16} : {}", "Latency tested", result.latency_tested);
                println!("{:<16} : {}", "Dropped", result.latency_dropped);
                println!("{:<16} : {}", "Unreachable", result.unreachable);
                println!("{:<16} : {}", "Speed tested", result.speed_tested);
                println!("{:<16} : {}", "Failed", result.failed());
                println!("{:<16} : {:.0}%", "Progress", result.progress);
                println!();
            }
        }
        Commands::Status { json } => {
            let app = App::open(config)?;
            let tasks = app.persister.restore().await?;
            let nodes = app.registry.all().await;
            let status = NodeStatus::from_nodes(&nodes, &app.config.filter);

            if json {
                let out = serde_json::json!({ "node_status": status, "tasks": tasks });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("\n=== nodepulse Status ===");
                println!("Nodes:   {}", status.total);
                println!("Current: {}", status.current);
                println!("Slow:    {}", status.slow);
                println!("Fault:   {}", status.fault);
                println!("\nTasks:");
                if tasks.is_empty() {
                    println!(" (none)");
                }
                for task in &tasks {
                    let last = task
                        .last_run_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(" - {} [{}] {} (last run: {})", task.id, task.status, task.name, last);
                }
                println!("========================\n");
            }
        }
        Commands::Schedule { action } => {
            let app = App::open(config)?;
            let mut tasks = app.persister.restore().await?;

            match action {
                ScheduleAction::List => {
                    if tasks.is_empty() {
                        println!("No tasks found.");
                    } else {
                        println!(
                            "{:<22} | {:<22} | {:<20} | {:<16} | Status",
                            "Id", "Name", "Type", "Cron"
                        );
                        println!("{:-<22}-|-{:-<22}-|-{:-<20}-|-{:-<16}-|-{:-<8}", "", "", "", "", "");
                        for t in &tasks {
                            println!(
                                "{:<22} | {:<22} | {:<20} | {:<16} | {}",
                                t.id, t.name, t.task_type, t.cron_expr, t.status
                            );
                        }
                    }
                }
                ScheduleAction::Add {
                    name,
                    cron,
                    task_type,
                    id,
                    disabled,
                } => {
                    let task_type = TaskType::from_str(&task_type)?;
                    Trigger::parse(&cron)?;
                    let id = id.unwrap_or_else(|| format!("task-{}", uuid::Uuid::new_v4()));
                    if tasks.iter().any(|t| t.id == id) {
                        return Err(SchedulerError::DuplicateTask(id).into());
                    }

                    let mut task = Task::new(id.clone(), task_type, name, cron);
                    if disabled {
                        task = task.disabled();
                    }
                    tasks.push(task);
                    app.persister.save_tasks(tasks).await?;
                    println!("Task '{}' added.", id);
                }
                ScheduleAction::Remove { id } => {
                    let before = tasks.len();
                    tasks.retain(|t| t.id != id);
                    if tasks.len() == before {
                        return Err(SchedulerError::TaskNotFound(id).into());
                    }
                    app.persister.save_tasks(tasks).await?;
                    println!("Task '{}' removed.", id);
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler::plan_runs(&tasks, chrono::Utc::now(), hours)?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for run in preview {
                            println!("{} : {} ({})", run.at.to_rfc3339(), run.task_name, run.task_type);
                        }
                    }
                }
                ScheduleAction::Run { id } => {
                    let task = tasks
                        .iter()
                        .find(|t| t.id == id)
                        .cloned()
                        .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))?;
                    let status = task.status;

                    // Registered disabled so no trigger fires alongside this run.
                    app.scheduler.add_task(task.disabled()).await?;
                    let result = app.scheduler.run_now(&id).await?;

                    if let Some(mut ran) = app.scheduler.get_task(&id).await {
                        ran.status = status;
                        if let Some(stored) = tasks.iter_mut().find(|t| t.id == id) {
                            *stored = ran;
                        }
                    }
                    app.persister.save_tasks(tasks).await?;

                    println!("{}", serde_json::to_string_pretty(&result)?);
                    if !matches!(result.status, scheduler::RunStatus::Success) {
                        anyhow::bail!("task '{}' finished with status {}", id, result.status);
                    }
                }
            }
        }
        Commands::Subscription { action } => {
            let app = App::open(config)?;
            app.persister.restore().await?;

            match action {
                SubscriptionAction::List => {
                    let subs = app.book.all().await;
                    if subs.is_empty() {
                        println!("No subscriptions found.");
                    } else {
                        println!("{:<40} | {:<16} | {:<6} | Url", "Id", "Name", "Nodes");
                        println!("{:-<40}-|-{:-<16}-|-{:-<6}-|-{:-<30}", "", "", "", "");
                        for s in subs {
                            println!("{:<40} | {:<16} | {:<6} | {}", s.id, s.name, s.node_count, s.url);
                        }
                    }
                }
                SubscriptionAction::Add { name, url } => {
                    url::Url::parse(&url).with_context(|| format!("invalid subscription URL '{}'", url))?;
                    let sub = Subscription::new(name, url);
                    let id = sub.id.clone();
                    app.book.add(sub).await?;
                    app.persister.save().await?;
                    println!("Subscription '{}' added.", id);
                }
                SubscriptionAction::Remove { id } => {
                    if app.book.remove(&id).await.is_none() {
                        anyhow::bail!("subscription '{}' not found", id);
                    }
                    app.persister.save().await?;
                    println!("Subscription '{}' removed.", id);
                }
                SubscriptionAction::Refresh => {
                    let summary = app.refresher.refresh_all().await?;
                    println!(
                        "Refreshed {}/{} subscriptions, {} nodes imported ({} failed).",
                        summary.refreshed, summary.subscriptions, summary.nodes_imported, summary.failed
                    );
                }
            }
        }
    }

    Ok(())
}
