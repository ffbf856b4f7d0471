//! Recurring task scheduler.
//!
//! Owns the task table and one trigger registration per enabled task. A
//! registration is a background loop (see [`engine`]) that sleeps until the
//! next cron firing and then runs the bound operation through
//! [`runner::run_with_deadline`].

pub mod cron;
pub mod engine;
pub mod history;
pub mod profiles;
pub mod runner;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::operations::Operation;
use crate::status::StatusRecorder;

pub use self::cron::Trigger;
pub use self::history::{RunStatus, TaskResult};
pub use self::runner::{run_with_deadline, DEFAULT_TASK_TIMEOUT};
pub use self::task::{Task, TaskStatus, TaskType};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task '{0}' already exists")]
    DuplicateTask(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("unsupported task type '{0}'")]
    UnsupportedTaskType(String),

    #[error("invalid trigger expression '{expr}': {reason}")]
    InvalidTrigger { expr: String, reason: String },

    #[error("preview window of {hours} hours exceeds the {max} hour limit")]
    PreviewWindow { hours: u64, max: u64 },
}

/// Longest dry-run window: ten years.
pub const MAX_PREVIEW_HOURS: u64 = 24 * 365 * 10;

/// One upcoming firing, as reported by a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub task_id: String,
    pub task_name: String,
    pub task_type: TaskType,
}

/// Firings of the enabled `tasks` in `(from, from + hours]`, in time order.
/// Tasks whose trigger does not parse are skipped.
pub fn plan_runs(
    tasks: &[Task],
    from: DateTime<Utc>,
    hours: u64,
) -> Result<Vec<PlannedRun>, SchedulerError> {
    let too_large = SchedulerError::PreviewWindow {
        hours,
        max: MAX_PREVIEW_HOURS,
    };
    if hours > MAX_PREVIEW_HOURS {
        return Err(too_large);
    }
    let window = i64::try_from(hours)
        .ok()
        .and_then(chrono::TimeDelta::try_hours)
        .ok_or(too_large)?;
    let mut preview = Vec::new();
    for task in tasks.iter().filter(|t| t.is_enabled()) {
        let Ok(trigger) = Trigger::parse(&task.cron_expr) else {
            continue;
        };
        for at in trigger.firings_within(&from, window) {
            preview.push(PlannedRun {
                at,
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                task_type: task.task_type,
            });
        }
    }
    preview.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.task_id.cmp(&b.task_id)));
    Ok(preview)
}

struct SchedulerInner {
    tasks: HashMap<String, Task>,
    triggers: HashMap<String, CancellationToken>,
    timeout: Duration,
}

/// Cheap to clone; every clone shares the same tables.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<RwLock<SchedulerInner>>,
    operations: Arc<HashMap<TaskType, Operation>>,
    recorder: Arc<StatusRecorder>,
}

impl Scheduler {
    pub fn new(operations: Vec<Operation>, recorder: Arc<StatusRecorder>, timeout: Duration) -> Self {
        let operations = operations.into_iter().map(|op| (op.kind(), op)).collect();
        Self {
            inner: Arc::new(RwLock::new(SchedulerInner {
                tasks: HashMap::new(),
                triggers: HashMap::new(),
                timeout,
            })),
            operations: Arc::new(operations),
            recorder,
        }
    }

    /// Register a task. Enabled tasks start firing immediately.
    ///
    /// On error the task table is left exactly as it was.
    pub async fn add_task(&self, task: Task) -> Result<(), SchedulerError> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }
        let trigger = self.validate(&task)?;

        if task.is_enabled() {
            let token = self.spawn_trigger(&task.id, trigger);
            inner.triggers.insert(task.id.clone(), token);
        }
        info!(task_id = %task.id, task_name = %task.name, task_type = %task.task_type, cron = %task.cron_expr, status = %task.status, "Task added");
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub async fn remove_task(&self, id: &str) -> Result<Task, SchedulerError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .remove(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
        if let Some(token) = inner.triggers.remove(id) {
            token.cancel();
        }
        info!(task_id = %id, task_name = %task.name, "Task removed");
        Ok(task)
    }

    /// Replace a task definition and its trigger in one step.
    ///
    /// The new definition is validated before anything is touched, so a
    /// rejected update keeps the old task and trigger running.
    pub async fn update_task(&self, mut task: Task) -> Result<(), SchedulerError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .tasks
            .get(&task.id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task.id.clone()))?;
        let trigger = self.validate(&task)?;

        task.created_at = existing.created_at;
        if task.last_run_at.is_none() {
            task.last_run_at = existing.last_run_at;
        }
        task.updated_at = Utc::now();

        if let Some(old) = inner.triggers.remove(&task.id) {
            old.cancel();
        }
        if task.is_enabled() {
            let token = self.spawn_trigger(&task.id, trigger);
            inner.triggers.insert(task.id.clone(), token);
        }
        info!(task_id = %task.id, task_name = %task.name, cron = %task.cron_expr, status = %task.status, "Task updated");
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(id).cloned()
    }

    /// Every task, sorted by id.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Applies to executions started after the call.
    pub async fn set_timeout(&self, timeout: Duration) {
        self.inner.write().await.timeout = timeout;
    }

    pub async fn timeout(&self) -> Duration {
        self.inner.read().await.timeout
    }

    pub async fn has_active_trigger(&self, id: &str) -> bool {
        self.inner
            .read()
            .await
            .triggers
            .get(id)
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Register tasks loaded at startup. Invalid ones are skipped.
    ///
    /// Returns how many were registered.
    pub async fn load_tasks(&self, tasks: Vec<Task>) -> usize {
        let mut loaded = 0;
        for task in tasks {
            let id = task.id.clone();
            match self.add_task(task).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!(task_id = %id, error = %e, "Skipping stored task"),
            }
        }
        loaded
    }

    /// Firings of every enabled task over the next `hours`, in time order.
    pub async fn preview_next_runs(&self, hours: u64) -> Result<Vec<PlannedRun>, SchedulerError> {
        plan_runs(&self.list_tasks().await, Utc::now(), hours)
    }

    /// Execute a task now, outside its trigger.
    pub async fn run_now(&self, id: &str) -> Result<TaskResult, SchedulerError> {
        self.fire(id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))
    }

    /// Cancel every trigger. Executions already running are left alone.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        for (_, token) in inner.triggers.drain() {
            token.cancel();
        }
        info!(tasks = inner.tasks.len(), "Scheduler stopped");
    }

    /// Run one execution of `id` and record it. `None` when the task (or
    /// its operation) is gone.
    pub(crate) async fn fire(&self, id: &str) -> Option<TaskResult> {
        let (task, timeout) = {
            let inner = self.inner.read().await;
            (inner.tasks.get(id)?.clone(), inner.timeout)
        };
        let operation = self.operations.get(&task.task_type)?.clone();

        debug!(task_id = %task.id, task_name = %task.name, "Task firing");
        let result = run_with_deadline(&task, async move { operation.run().await }, timeout).await;

        {
            let mut inner = self.inner.write().await;
            if let Some(stored) = inner.tasks.get_mut(id) {
                stored.last_run_at = Some(result.started_at);
                stored.updated_at = result.finished_at;
            }
        }
        self.recorder.add_task_history(result.clone()).await;
        Some(result)
    }

    fn validate(&self, task: &Task) -> Result<Trigger, SchedulerError> {
        if !self.operations.contains_key(&task.task_type) {
            return Err(SchedulerError::UnsupportedTaskType(task.task_type.to_string()));
        }
        Trigger::parse(&task.cron_expr)
    }

    fn spawn_trigger(&self, id: &str, trigger: Trigger) -> CancellationToken {
        let token = CancellationToken::new();
        tokio::spawn(engine::run_trigger_loop(
            self.clone(),
            id.to_string(),
            trigger,
            token.clone(),
        ));
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, ProbeSettings};
    use crate::operations::{NodeTestJob, Operation};
    use crate::probes::{NodeProber, ProbeConfig, ProbeEngine, ProbeError};
    use crate::registry::{Node, NodeRegistry};
    use crate::storage::{MemoryStore, Persister};
    use crate::subscription::SubscriptionBook;

    struct NeverCalled;

    #[async_trait::async_trait]
    impl NodeProber for NeverCalled {
        async fn latency(&self, node: &Node, _timeout: Duration) -> Result<Duration, ProbeError> {
            Err(ProbeError::Connect {
                endpoint: node.endpoint(),
                reason: "no network in tests".to_string(),
            })
        }

        async fn download_speed(&self, _node: &Node, _config: &ProbeConfig) -> Result<f64, ProbeError> {
            Err(ProbeError::Download("no network in tests".to_string()))
        }
    }

    fn scheduler() -> Scheduler {
        let registry = Arc::new(NodeRegistry::new());
        let engine = Arc::new(ProbeEngine::new(registry.clone(), Arc::new(NeverCalled)));
        let persister = Persister::new(
            Arc::new(MemoryStore::default()),
            registry.clone(),
            Arc::new(SubscriptionBook::new()),
        );
        let job = NodeTestJob::new(engine, ProbeSettings::default().to_probe_config(), persister);
        let recorder = Arc::new(StatusRecorder::new(registry, FilterConfig::default()));
        Scheduler::new(vec![Operation::NodeTest(Arc::new(job))], recorder, Duration::from_secs(5))
    }

    fn hourly(id: &str) -> Task {
        Task::new(id, TaskType::NodeTest, format!("probe {}", id), "0 0 * * * *")
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let s = scheduler();
        s.add_task(hourly("t1")).await.unwrap();
        assert_eq!(s.get_task("t1").await.unwrap().name, "probe t1");
        assert!(s.has_active_trigger("t1").await);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_trigger_leaves_table_unchanged() {
        let s = scheduler();
        s.add_task(hourly("t1")).await.unwrap();

        let bad = Task::new("t2", TaskType::NodeTest, "bad", "every tuesday");
        let err = s.add_task(bad).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTrigger { .. }));
        assert_eq!(s.list_tasks().await.len(), 1);
        assert!(!s.has_active_trigger("t2").await);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_keeps_original_trigger() {
        let s = scheduler();
        s.add_task(hourly("t1")).await.unwrap();

        let again = Task::new("t1", TaskType::NodeTest, "other", "*/5 * * * * *");
        let err = s.add_task(again).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask(ref id) if id == "t1"));
        let kept = s.get_task("t1").await.unwrap();
        assert_eq!(kept.name, "probe t1");
        assert_eq!(kept.cron_expr, "0 0 * * * *");
        assert!(s.has_active_trigger("t1").await);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_unbound_type_is_unsupported() {
        let s = scheduler();
        let task = Task::new("r1", TaskType::SubscriptionRefresh, "refresh", "0 0 3 * * *");
        let err = s.add_task(task).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedTaskType(_)));
        assert!(s.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let s = scheduler();
        s.add_task(hourly("t1")).await.unwrap();
        let err = s.remove_task("T404").await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskNotFound(ref id) if id == "T404"));
        assert_eq!(s.list_tasks().await.len(), 1);

        s.remove_task("t1").await.unwrap();
        assert!(s.list_tasks().await.is_empty());
        assert!(!s.has_active_trigger("t1").await);
    }

    #[tokio::test]
    async fn test_update_replaces_definition() {
        let s = scheduler();
        let original = hourly("t1");
        let created_at = original.created_at;
        s.add_task(original).await.unwrap();

        let mut changed = Task::new("t1", TaskType::NodeTest, "renamed", "0 30 * * * *");
        changed.created_at = Utc::now() + chrono::Duration::days(1);
        s.update_task(changed).await.unwrap();

        let stored = s.get_task("t1").await.unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.cron_expr, "0 30 * * * *");
        assert_eq!(stored.created_at, created_at);
        assert!(s.has_active_trigger("t1").await);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_old_task() {
        let s = scheduler();
        s.add_task(hourly("t1")).await.unwrap();

        let bad = Task::new("t1", TaskType::NodeTest, "renamed", "not a cron");
        assert!(s.update_task(bad).await.is_err());
        assert_eq!(s.get_task("t1").await.unwrap().name, "probe t1");
        assert!(s.has_active_trigger("t1").await);

        let missing = hourly("nope");
        assert!(matches!(
            s.update_task(missing).await,
            Err(SchedulerError::TaskNotFound(_))
        ));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_task_has_no_trigger() {
        let s = scheduler();
        s.add_task(hourly("t1").disabled()).await.unwrap();
        assert!(s.get_task("t1").await.is_some());
        assert!(!s.has_active_trigger("t1").await);
        assert!(s.preview_next_runs(24).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preview_is_sorted() {
        let s = scheduler();
        s.add_task(hourly("t1")).await.unwrap();
        s.add_task(Task::new("t2", TaskType::NodeTest, "half", "0 30 * * * *"))
            .await
            .unwrap();
        let runs = s.preview_next_runs(3).await.unwrap();
        assert!(runs.len() >= 5 && runs.len() <= 6, "got {}", runs.len());
        assert!(runs.windows(2).all(|w| w[0].at <= w[1].at));
        s.shutdown().await;
    }

    #[test]
    fn test_plan_runs_skips_disabled_and_invalid() {
        use chrono::TimeZone;
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let tasks = vec![
            Task::new("a", TaskType::NodeTest, "a", "0 0 */4 * * *"),
            Task::new("b", TaskType::NodeTest, "b", "0 0 1 * * *").disabled(),
            Task::new("c", TaskType::NodeTest, "c", "bogus"),
            Task::new("d", TaskType::SubscriptionRefresh, "d", "0 0 3 * * *"),
        ];
        let runs = plan_runs(&tasks, from, 24).unwrap();
        assert_eq!(runs.len(), 7);
        assert_eq!(runs[0].task_id, "d");
        assert!(runs.iter().all(|r| r.task_id != "b" && r.task_id != "c"));
    }

    #[test]
    fn test_plan_runs_rejects_oversized_window() {
        let tasks = vec![Task::new("a", TaskType::NodeTest, "a", "* * * * * *")];
        for hours in [MAX_PREVIEW_HOURS + 1, 3_000_000_000, u64::MAX] {
            let err = plan_runs(&tasks, Utc::now(), hours).unwrap_err();
            assert!(matches!(err, SchedulerError::PreviewWindow { hours: h, .. } if h == hours));
        }

        let runs = plan_runs(&tasks, Utc::now(), MAX_PREVIEW_HOURS).unwrap();
        assert_eq!(runs.len(), super::cron::MAX_FIRINGS);
    }

    #[tokio::test]
    async fn test_run_now_records_history() {
        let s = scheduler();
        s.add_task(hourly("t1")).await.unwrap();

        let result = s.run_now("t1").await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        let stored = s.get_task("t1").await.unwrap();
        assert_eq!(stored.last_run_at, Some(result.started_at));

        let status = s.recorder.system_status().await;
        assert_eq!(status.last_task_name.as_deref(), Some("probe t1"));
        assert_eq!(status.last_task_status, Some(RunStatus::Success));

        assert!(matches!(s.run_now("T404").await, Err(SchedulerError::TaskNotFound(_))));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_fires_on_schedule() {
        let s = scheduler();
        s.add_task(Task::new("fast", TaskType::NodeTest, "every second", "* * * * * *"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        s.shutdown().await;

        let history = s.recorder.recent_tasks().await;
        assert!(!history.is_empty());
        assert!(history.iter().all(|r| r.task_id == "fast"));
        assert!(s.get_task("fast").await.unwrap().last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_firing() {
        let s = scheduler();
        s.add_task(Task::new("fast", TaskType::NodeTest, "every second", "* * * * * *"))
            .await
            .unwrap();
        s.shutdown().await;
        assert!(!s.has_active_trigger("fast").await);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(s.recorder.recent_tasks().await.is_empty());
    }
}
