//! Batch probe engine.
//!
//! Each node runs latency then (if fast enough) speed in one spawned test.
//! A semaphore gate caps how many tests are in flight; the producer blocks
//! on it, so the bound holds regardless of batch size. Results fan back in
//! over a channel, where counters and progress are updated once per node.
//!
//! Both probes run under an engine-side deadline, so a prober that ignores
//! its timeout still cannot hold a permit past the node's budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use super::{BatchResult, NodeProber, ProbeConfig, ProbeError, ProbeType, Progress};
use crate::registry::{Node, NodeRegistry};

/// Slack past `speed_timeout` so a download cut at its own deadline can
/// still report the partial speed.
const SPEED_GRACE: Duration = Duration::from_millis(500);

/// What happened to one node in a batch.
enum NodeOutcome {
    /// Connect failed or timed out. Not dropped, but never speed tested.
    Unreachable,
    /// Connected, but over the latency threshold.
    Dropped(Node),
    SpeedTested(Node),
    SpeedFailed,
}

pub struct ProbeEngine {
    registry: Arc<NodeRegistry>,
    prober: Arc<dyn NodeProber>,
    progress: watch::Sender<Progress>,
}

impl ProbeEngine {
    pub fn new(registry: Arc<NodeRegistry>, prober: Arc<dyn NodeProber>) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            registry,
            prober,
            progress,
        }
    }

    /// Watch the progress of the running (or last) batch.
    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Probe every node currently in the registry.
    ///
    /// Returns once the whole batch has completed. Per-node failures are
    /// logged and counted; only an invalid config is an error.
    pub async fn test_nodes(&self, config: &ProbeConfig) -> Result<BatchResult, ProbeError> {
        let nodes = self.registry.all().await;
        self.test_node_set(nodes, config).await
    }

    /// Probe an explicit set of nodes, writing results to the registry.
    pub async fn test_node_set(
        &self,
        nodes: Vec<Node>,
        config: &ProbeConfig,
    ) -> Result<BatchResult, ProbeError> {
        config.validate()?;

        let total = nodes.len();
        let mut result = BatchResult {
            total,
            ..Default::default()
        };
        self.progress.send_replace(Progress::new(0, total));
        info!(total, concurrency = config.concurrency, "Starting probe batch");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(config.concurrency));

        let producer = {
            let registry = self.registry.clone();
            let prober = self.prober.clone();
            let config = config.clone();
            tokio::spawn(async move {
                for node in nodes {
                    let Ok(permit) = gate.clone().acquire_owned().await else {
                        break;
                    };
                    let registry = registry.clone();
                    let prober = prober.clone();
                    let config = config.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let outcome = test_one(&*prober, &registry, node, &config).await;
                        drop(permit);
                        let _ = tx.send(outcome);
                    });
                }
            })
        };

        let mut completed = 0;
        while completed < total {
            let Some(outcome) = rx.recv().await else {
                break;
            };
            completed += 1;
            result.latency_tested += 1;
            match outcome {
                NodeOutcome::Unreachable => result.unreachable += 1,
                NodeOutcome::Dropped(node) => {
                    result.latency_dropped += 1;
                    result.tested_nodes.push(node);
                }
                NodeOutcome::SpeedTested(node) => {
                    result.speed_tested += 1;
                    result.tested_nodes.push(node);
                }
                NodeOutcome::SpeedFailed => result.speed_failed += 1,
            }
            let progress = Progress::new(completed, total);
            result.progress = progress.percent;
            self.progress.send_replace(progress);
        }

        if let Err(e) = producer.await {
            warn!(error = %e, "probe producer task failed");
        }

        // A worker that panicked never reports; close the books anyway.
        if completed < total {
            warn!(missing = total - completed, "probe workers exited without reporting");
        }
        result.progress = 100.0;
        self.progress.send_replace(Progress::new(total, total));

        info!(
            total = result.total,
            latency_tested = result.latency_tested,
            latency_dropped = result.latency_dropped,
            unreachable = result.unreachable,
            speed_tested = result.speed_tested,
            failed = result.failed(),
            "Probe batch complete"
        );
        Ok(result)
    }
}

async fn test_one(
    prober: &dyn NodeProber,
    registry: &NodeRegistry,
    node: Node,
    config: &ProbeConfig,
) -> NodeOutcome {
    let attempt = tokio::time::timeout(
        config.latency_timeout,
        prober.latency(&node, config.latency_timeout),
    )
    .await
    .unwrap_or_else(|_| {
        Err(ProbeError::ConnectTimeout {
            endpoint: node.endpoint(),
            timeout_ms: config.latency_timeout.as_millis() as u64,
        })
    });
    let latency = match attempt {
        Ok(elapsed) => u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX).max(1),
        Err(e) => {
            warn!(node_id = %node.id, probe = %ProbeType::Latency, error = %e, "Node probe failed");
            // Earlier measurements no longer describe this node.
            registry
                .update(&node.id, |n| {
                    n.latency_ms = 0;
                    n.download_speed = 0.0;
                    n.last_tested_at = None;
                })
                .await;
            return NodeOutcome::Unreachable;
        }
    };

    registry.update(&node.id, |n| n.latency_ms = latency).await;

    if latency > config.max_latency_ms {
        tracing::debug!(node_id = %node.id, latency_ms = latency, "Node over latency threshold, skipping speed test");
        let mut dropped = node;
        dropped.latency_ms = latency;
        return NodeOutcome::Dropped(dropped);
    }

    let speed = tokio::time::timeout(
        config.speed_timeout + SPEED_GRACE,
        prober.download_speed(&node, config),
    )
    .await
    .unwrap_or_else(|_| Err(ProbeError::Download("speed test exceeded its deadline".to_string())));
    match speed {
        Ok(speed) => {
            let tested_at = Utc::now();
            registry
                .update(&node.id, |n| {
                    n.download_speed = speed;
                    n.last_tested_at = Some(tested_at);
                })
                .await;
            let mut tested = node;
            tested.latency_ms = latency;
            tested.download_speed = speed;
            tested.last_tested_at = Some(tested_at);
            NodeOutcome::SpeedTested(tested)
        }
        Err(e) => {
            warn!(node_id = %node.id, probe = %ProbeType::Speed, error = %e, "Node probe failed");
            NodeOutcome::SpeedFailed
        }
    }
}
