//! Persistence for nodes, subscriptions and task definitions.
//!
//! [`Store`] is synchronous; async callers go through [`Persister`], which
//! snapshots the in-memory state and writes it on the blocking pool.

pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::{debug, info};

use crate::registry::{Node, NodeRegistry, Protocol};
use crate::scheduler::{Task, TaskStatus, TaskType};
use crate::subscription::{Subscription, SubscriptionBook};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("Failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Everything the store holds.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub subscriptions: Vec<Subscription>,
    pub tasks: Vec<Task>,
}

/// Whole-state persistence. Each save replaces what was stored before.
pub trait Store: Send + Sync {
    fn load(&self) -> Result<Snapshot>;

    /// Replace stored nodes and subscriptions.
    fn save_pool(&self, nodes: &[Node], subscriptions: &[Subscription]) -> Result<()>;

    /// Replace stored task definitions.
    fn save_tasks(&self, tasks: &[Task]) -> Result<()>;

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.save_pool(&snapshot.nodes, &snapshot.subscriptions)?;
        self.save_tasks(&snapshot.tasks)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_pool(path)?,
        })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

fn text_err(col: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

fn ts(col: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| text_err(col, e))
}

fn opt_ts(col: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| ts(col, r)).transpose()
}

impl Store for SqliteStore {
    fn load(&self) -> Result<Snapshot> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id, protocol, alias, address, port, subscription_id, group_name,
                    latency_ms, download_speed, last_tested_at
             FROM nodes ORDER BY id",
        )?;
        let nodes = stmt
            .query_map([], |row| {
                Ok(Node {
                    id: row.get(0)?,
                    protocol: Protocol::from_scheme(&row.get::<_, String>(1)?),
                    alias: row.get(2)?,
                    address: row.get(3)?,
                    port: row.get(4)?,
                    subscription_id: row.get(5)?,
                    group: row.get(6)?,
                    latency_ms: row.get(7)?,
                    download_speed: row.get(8)?,
                    last_tested_at: opt_ts(9, row.get(9)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load nodes")?;

        let mut stmt = conn.prepare(
            "SELECT id, name, url, node_count, created_at, updated_at
             FROM subscriptions ORDER BY created_at, id",
        )?;
        let subscriptions = stmt
            .query_map([], |row| {
                Ok(Subscription {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    url: row.get(2)?,
                    node_count: row.get::<_, i64>(3)? as usize,
                    created_at: ts(4, row.get(4)?)?,
                    updated_at: ts(5, row.get(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load subscriptions")?;

        let mut stmt = conn.prepare(
            "SELECT id, task_type, name, status, cron_expr, last_run_at, created_at, updated_at
             FROM tasks ORDER BY id",
        )?;
        let tasks = stmt
            .query_map([], |row| {
                let task_type: TaskType = row.get::<_, String>(1)?.parse().map_err(|e| text_err(1, e))?;
                let status: TaskStatus = row
                    .get::<_, String>(3)?
                    .parse()
                    .map_err(|e: String| text_err(3, std::io::Error::other(e)))?;
                Ok(Task {
                    id: row.get(0)?,
                    task_type,
                    name: row.get(2)?,
                    status,
                    cron_expr: row.get(4)?,
                    last_run_at: opt_ts(5, row.get(5)?)?,
                    created_at: ts(6, row.get(6)?)?,
                    updated_at: ts(7, row.get(7)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load tasks")?;

        debug!(nodes = nodes.len(), subscriptions = subscriptions.len(), tasks = tasks.len(), "Loaded snapshot");
        Ok(Snapshot {
            nodes,
            subscriptions,
            tasks,
        })
    }

    fn save_pool(&self, nodes: &[Node], subscriptions: &[Subscription]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM nodes", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO nodes (id, protocol, alias, address, port, subscription_id, group_name,
                                    latency_ms, download_speed, last_tested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for n in nodes {
                insert.execute(params![
                    n.id,
                    n.protocol.to_string(),
                    n.alias,
                    n.address,
                    n.port,
                    n.subscription_id,
                    n.group,
                    n.latency_ms,
                    n.download_speed,
                    n.last_tested_at.map(|t| t.to_rfc3339()),
                ])?;
            }
        }

        tx.execute("DELETE FROM subscriptions", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO subscriptions (id, name, url, node_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for s in subscriptions {
                insert.execute(params![
                    s.id,
                    s.name,
                    s.url,
                    s.node_count as i64,
                    s.created_at.to_rfc3339(),
                    s.updated_at.to_rfc3339(),
                ])?;
            }
        }

        tx.commit().context("Failed to save node pool")?;
        debug!(nodes = nodes.len(), subscriptions = subscriptions.len(), "Saved node pool");
        Ok(())
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM tasks", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO tasks (id, task_type, name, status, cron_expr, last_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for t in tasks {
                insert.execute(params![
                    t.id,
                    t.task_type.to_string(),
                    t.name,
                    t.status.to_string(),
                    t.cron_expr,
                    t.last_run_at.map(|x| x.to_rfc3339()),
                    t.created_at.to_rfc3339(),
                    t.updated_at.to_rfc3339(),
                ])?;
            }
        }

        tx.commit().context("Failed to save tasks")?;
        debug!(tasks = tasks.len(), "Saved tasks");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Keeps the snapshot in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl MemoryStore {
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Snapshot>> {
        self.snapshot
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Snapshot> {
        Ok(self.lock()?.clone())
    }

    fn save_pool(&self, nodes: &[Node], subscriptions: &[Subscription]) -> Result<()> {
        let mut snapshot = self.lock()?;
        snapshot.nodes = nodes.to_vec();
        snapshot.subscriptions = subscriptions.to_vec();
        Ok(())
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        self.lock()?.tasks = tasks.to_vec();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persister
// ---------------------------------------------------------------------------

/// Moves state between the in-memory registry/book and a [`Store`].
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn Store>,
    registry: Arc<NodeRegistry>,
    book: Arc<SubscriptionBook>,
}

impl Persister {
    pub fn new(store: Arc<dyn Store>, registry: Arc<NodeRegistry>, book: Arc<SubscriptionBook>) -> Self {
        Self { store, registry, book }
    }

    /// Load the store into the registry and book, returning the stored tasks.
    pub async fn restore(&self) -> Result<Vec<Task>> {
        let store = self.store.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.load())
            .await
            .context("store load task panicked")??;

        info!(
            nodes = snapshot.nodes.len(),
            subscriptions = snapshot.subscriptions.len(),
            tasks = snapshot.tasks.len(),
            "Restored state"
        );
        self.registry.replace_all(snapshot.nodes).await;
        self.book.replace_all(snapshot.subscriptions).await;
        Ok(snapshot.tasks)
    }

    /// Save the current nodes and subscriptions.
    pub async fn save(&self) -> Result<()> {
        let nodes = self.registry.all().await;
        let subscriptions = self.book.all().await;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_pool(&nodes, &subscriptions))
            .await
            .context("store save task panicked")?
    }

    pub async fn save_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_tasks(&tasks))
            .await
            .context("store save task panicked")?
    }
}
