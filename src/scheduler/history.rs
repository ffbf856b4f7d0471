//! Execution records for scheduled runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{Task, TaskType};

/// Outcome of one execution. `Running` is transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// A record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub task_name: String,
    pub task_type: TaskType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub message: String,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn running(task: &Task) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            task_type: task.task_type,
            started_at: now,
            finished_at: now,
            status: RunStatus::Running,
            message: String::new(),
            error: None,
        }
    }

    /// Record the terminal status. `elapsed` is measured on a monotonic
    /// clock, so `finished_at >= started_at` always holds.
    pub(crate) fn finish(
        &mut self,
        status: RunStatus,
        elapsed: std::time::Duration,
        message: String,
        error: Option<String>,
    ) {
        debug_assert!(status.is_terminal());
        debug_assert!(!self.status.is_terminal(), "terminal status recorded twice");
        self.finished_at = self.started_at
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.status = status;
        self.message = message;
        self.error = error;
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }
}
