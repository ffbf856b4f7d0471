//! nodepulse -- scheduled refresh and health probing for proxy-node pools.
//!
//! This crate provides the node registry, the concurrent probe engine, the
//! cron task scheduler with deadline-bounded execution, and the status
//! recorder that ties them together.

pub mod config;
pub mod operations;
pub mod probes;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod subscription;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::operations::{NodeTestJob, Operation};
use crate::probes::{http::SpeedProbe, ProbeEngine, TcpHttpProber};
use crate::registry::NodeRegistry;
use crate::scheduler::{profiles, Scheduler, Task};
use crate::status::StatusRecorder;
use crate::storage::{Persister, SqliteStore, Store};
use crate::subscription::{HttpSubscriptionParser, SubscriptionBook, SubscriptionRefresher};

/// Every long-lived component, built once and shared by `Arc`.
pub struct App {
    pub config: AppConfig,
    pub registry: Arc<NodeRegistry>,
    pub book: Arc<SubscriptionBook>,
    pub persister: Persister,
    pub engine: Arc<ProbeEngine>,
    pub recorder: Arc<StatusRecorder>,
    pub refresher: Arc<SubscriptionRefresher>,
    pub node_test: Arc<NodeTestJob>,
    pub scheduler: Scheduler,
}

impl App {
    /// Wire the components over the configured SQLite database.
    pub fn open(config: AppConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.storage.path)
            .with_context(|| format!("Failed to open store at {}", config.storage.path.display()))?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn Store>) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new());
        let book = Arc::new(SubscriptionBook::new());
        let persister = Persister::new(store, registry.clone(), book.clone());

        let prober = TcpHttpProber::new(SpeedProbe::new(&config.probe)?);
        let engine = Arc::new(ProbeEngine::new(registry.clone(), Arc::new(prober)));
        let recorder = Arc::new(StatusRecorder::new(registry.clone(), config.filter.clone()));

        let parser = HttpSubscriptionParser::new(config.subscription.fetch_timeout())?;
        let refresher = Arc::new(SubscriptionRefresher::new(
            book.clone(),
            registry.clone(),
            Arc::new(parser),
            persister.clone(),
        ));
        let node_test = Arc::new(NodeTestJob::new(
            engine.clone(),
            config.probe.to_probe_config(),
            persister.clone(),
        ));

        let scheduler = Scheduler::new(
            vec![
                Operation::SubscriptionRefresh(refresher.clone()),
                Operation::NodeTest(node_test.clone()),
            ],
            recorder.clone(),
            config.scheduler.task_timeout(),
        );

        Ok(Self {
            config,
            registry,
            book,
            persister,
            engine,
            recorder,
            refresher,
            node_test,
            scheduler,
        })
    }

    /// Load stored state. Seeds the default tasks into an empty store when
    /// configured to, and returns the task definitions.
    pub async fn restore(&self) -> Result<Vec<Task>> {
        let mut tasks = self.persister.restore().await?;
        if tasks.is_empty() && self.config.scheduler.seed_default_tasks {
            tasks = profiles::defaults();
            self.persister.save_tasks(tasks.clone()).await?;
            info!(tasks = tasks.len(), "Seeded default tasks");
        }
        Ok(tasks)
    }
}

/// Run the daemon: restore state, start every trigger, and run until Ctrl-C.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Initialize storage and components
    info!(db_path = %config.storage.path.display(), "Initializing database");
    let app = App::open(config)?;

    // 2. Register stored tasks
    let tasks = app.restore().await?;
    let loaded = app.scheduler.load_tasks(tasks).await;
    let status = app.recorder.update_node_status().await;
    info!(
        tasks = loaded,
        nodes = status.total,
        current = status.current,
        "nodepulse running"
    );

    // 3. Wait for shutdown
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    // 4. Stop triggers and save what the runs changed
    app.scheduler.shutdown().await;
    app.persister
        .save_tasks(app.scheduler.list_tasks().await)
        .await?;
    app.persister.save().await?;
    info!("nodepulse stopped");
    Ok(())
}
