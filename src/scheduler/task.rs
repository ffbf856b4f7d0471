//! Recurring task definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SchedulerError;

/// Kind of work a task runs. Each kind maps to one bound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    SubscriptionRefresh,
    NodeTest,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::SubscriptionRefresh => write!(f, "subscription-refresh"),
            TaskType::NodeTest => write!(f, "node-test"),
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription-refresh" => Ok(TaskType::SubscriptionRefresh),
            "node-test" => Ok(TaskType::NodeTest),
            other => Err(SchedulerError::UnsupportedTaskType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Enabled,
    Disabled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Enabled => write!(f, "enabled"),
            TaskStatus::Disabled => write!(f, "disabled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(TaskStatus::Enabled),
            "disabled" => Ok(TaskStatus::Disabled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A recurring job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub name: String,
    pub status: TaskStatus,
    /// Cron expression with a leading seconds field.
    pub cron_expr: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        task_type: TaskType,
        name: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type,
            name: name.into(),
            status: TaskStatus::Enabled,
            cron_expr: cron_expr.into(),
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.status = TaskStatus::Disabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == TaskStatus::Enabled
    }
}
