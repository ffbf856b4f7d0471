//! System status and task history.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::FilterConfig;
use crate::registry::{Node, NodeRegistry};
use crate::scheduler::{RunStatus, TaskResult};

/// Tested nodes above this latency count as faulty, whatever the filter says.
pub const FAULT_LATENCY_MS: u32 = 400;

/// Task results kept in the rolling history.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub total: usize,
    /// Nodes passing the node filter.
    pub current: usize,
    pub slow: usize,
    pub fault: usize,
}

impl NodeStatus {
    pub fn from_nodes(nodes: &[Node], filter: &FilterConfig) -> Self {
        let mut status = NodeStatus {
            total: nodes.len(),
            ..Default::default()
        };
        for node in nodes.iter().filter(|n| n.is_tested()) {
            if node.latency_ms > FAULT_LATENCY_MS {
                status.fault += 1;
            }
            if node.download_speed < filter.min_speed {
                status.slow += 1;
            }
            if node.passes(filter) {
                status.current += 1;
            }
        }
        status
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemStatus {
    pub node_status: NodeStatus,
    pub last_update_at: Option<DateTime<Utc>>,
    pub last_task_at: Option<DateTime<Utc>>,
    pub last_task_name: Option<String>,
    pub last_task_status: Option<RunStatus>,
    /// Newest first.
    pub recent_tasks: Vec<TaskResult>,
}

#[derive(Default)]
struct StatusState {
    node_status: NodeStatus,
    last_update_at: Option<DateTime<Utc>>,
    history: VecDeque<TaskResult>,
}

pub struct StatusRecorder {
    registry: Arc<NodeRegistry>,
    filter: FilterConfig,
    state: RwLock<StatusState>,
}

impl StatusRecorder {
    pub fn new(registry: Arc<NodeRegistry>, filter: FilterConfig) -> Self {
        Self {
            registry,
            filter,
            state: RwLock::new(StatusState::default()),
        }
    }

    /// Recompute node counters from the registry.
    pub async fn update_node_status(&self) -> NodeStatus {
        // Snapshot first so the registry lock is released before ours is taken.
        let nodes = self.registry.all().await;
        let status = NodeStatus::from_nodes(&nodes, &self.filter);

        let mut state = self.state.write().await;
        state.node_status = status.clone();
        state.last_update_at = Some(Utc::now());
        status
    }

    pub async fn add_task_history(&self, result: TaskResult) {
        debug!(task_id = %result.task_id, status = %result.status, "Recording task result");
        let mut state = self.state.write().await;
        state.history.push_front(result);
        state.history.truncate(HISTORY_LIMIT);
    }

    pub async fn system_status(&self) -> SystemStatus {
        self.update_node_status().await;
        let state = self.state.read().await;
        let last = state.history.front();
        SystemStatus {
            node_status: state.node_status.clone(),
            last_update_at: state.last_update_at,
            last_task_at: last.map(|r| r.started_at),
            last_task_name: last.map(|r| r.task_name.clone()),
            last_task_status: last.map(|r| r.status),
            recent_tasks: state.history.iter().cloned().collect(),
        }
    }

    /// Newest first.
    pub async fn recent_tasks(&self) -> Vec<TaskResult> {
        self.state.read().await.history.iter().cloned().collect()
    }
}
