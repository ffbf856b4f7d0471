//! The operations a task can run.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::probes::{BatchResult, ProbeConfig, ProbeEngine};
use crate::scheduler::TaskType;
use crate::storage::Persister;
use crate::subscription::SubscriptionRefresher;

/// A bound operation, one per [`TaskType`].
#[derive(Clone)]
pub enum Operation {
    SubscriptionRefresh(Arc<SubscriptionRefresher>),
    NodeTest(Arc<NodeTestJob>),
}

impl Operation {
    pub fn kind(&self) -> TaskType {
        match self {
            Operation::SubscriptionRefresh(_) => TaskType::SubscriptionRefresh,
            Operation::NodeTest(_) => TaskType::NodeTest,
        }
    }

    pub async fn run(&self) -> Result<()> {
        match self {
            Operation::SubscriptionRefresh(refresher) => refresher.refresh_all().await.map(|_| ()),
            Operation::NodeTest(job) => job.run().await.map(|_| ()),
        }
    }
}

/// Probe the whole registry, then save.
pub struct NodeTestJob {
    engine: Arc<ProbeEngine>,
    config: ProbeConfig,
    persister: Persister,
}

impl NodeTestJob {
    pub fn new(engine: Arc<ProbeEngine>, config: ProbeConfig, persister: Persister) -> Self {
        Self {
            engine,
            config,
            persister,
        }
    }

    pub async fn run(&self) -> Result<BatchResult> {
        let result = self
            .engine
            .test_nodes(&self.config)
            .await
            .context("Node test batch rejected")?;
        info!(
            total = result.total,
            latency_tested = result.latency_tested,
            dropped = result.latency_dropped,
            unreachable = result.unreachable,
            speed_tested = result.speed_tested,
            failed = result.failed(),
            "Node test finished"
        );
        self.persister.save().await?;
        Ok(result)
    }
}
