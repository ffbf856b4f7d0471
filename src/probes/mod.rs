//! Node probing: TCP connect latency and HTTP download speed, fanned out
//! across the registry with bounded concurrency.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::registry::Node;

pub mod engine;
pub mod http;
pub mod tcp;

pub use self::engine::ProbeEngine;

/// Per-node probe failures. Always recovered at the node boundary.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("connect to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("download test failed: {0}")]
    Download(String),

    #[error("invalid probe config: {0}")]
    InvalidConfig(&'static str),
}

/// Which probe a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    Latency,
    Speed,
}

impl std::fmt::Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeType::Latency => write!(f, "latency"),
            ProbeType::Speed => write!(f, "speed"),
        }
    }
}

/// Settings for one batch.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Nodes above this latency are dropped before the speed test (ms).
    pub max_latency_ms: u32,
    /// Download URLs tried in order until one succeeds.
    pub test_urls: Vec<String>,
    pub latency_timeout: Duration,
    pub speed_timeout: Duration,
    /// Node tests in flight at once.
    pub concurrency: usize,
    pub buffer_size: usize,
    pub max_download_bytes: u64,
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.max_latency_ms == 0 {
            return Err(ProbeError::InvalidConfig("max_latency_ms must be positive"));
        }
        if self.test_urls.is_empty() {
            return Err(ProbeError::InvalidConfig("at least one test URL is required"));
        }
        if self.latency_timeout.is_zero() || self.speed_timeout.is_zero() {
            return Err(ProbeError::InvalidConfig("timeouts must be positive"));
        }
        if self.concurrency == 0 {
            return Err(ProbeError::InvalidConfig("concurrency must be positive"));
        }
        if self.buffer_size == 0 || self.max_download_bytes == 0 {
            return Err(ProbeError::InvalidConfig("download sizes must be positive"));
        }
        Ok(())
    }
}

/// Aggregate outcome of one batch.
///
/// `latency_tested == latency_dropped + eligible`, where eligible nodes were
/// under the latency threshold or unreachable;
/// `speed_tested + speed_failed + unreachable == eligible`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub latency_tested: usize,
    /// Connected, but over the latency threshold.
    pub latency_dropped: usize,
    /// Connect failed or timed out. Eligible, never speed tested.
    pub unreachable: usize,
    pub speed_tested: usize,
    pub speed_failed: usize,
    /// 0-100.
    pub progress: f64,
    /// Nodes that completed their probes without error, post-update.
    pub tested_nodes: Vec<Node>,
}

impl BatchResult {
    pub fn eligible(&self) -> usize {
        self.latency_tested - self.latency_dropped
    }

    pub fn failed(&self) -> usize {
        self.unreachable + self.speed_failed
    }
}

/// Batch progress snapshot published while a batch runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        Self {
            completed,
            total,
            percent,
        }
    }
}

/// The network measurements the engine needs for one node.
#[async_trait::async_trait]
pub trait NodeProber: Send + Sync {
    /// Time to establish a connection to the node.
    async fn latency(&self, node: &Node, timeout: Duration) -> Result<Duration, ProbeError>;

    /// Download throughput in MB/s.
    async fn download_speed(&self, node: &Node, config: &ProbeConfig) -> Result<f64, ProbeError>;
}

/// Real prober: TCP connect for latency, pooled HTTP client for speed.
pub struct TcpHttpProber {
    speed: http::SpeedProbe,
}

impl TcpHttpProber {
    pub fn new(speed: http::SpeedProbe) -> Self {
        Self { speed }
    }
}

#[async_trait::async_trait]
impl NodeProber for TcpHttpProber {
    async fn latency(&self, node: &Node, timeout: Duration) -> Result<Duration, ProbeError> {
        tcp::connect_latency(&node.endpoint(), timeout).await
    }

    async fn download_speed(&self, _node: &Node, config: &ProbeConfig) -> Result<f64, ProbeError> {
        self.speed.measure(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProbeConfig {
        ProbeConfig {
            max_latency_ms: 400,
            test_urls: vec!["http://127.0.0.1/blob".to_string()],
            latency_timeout: Duration::from_secs(1),
            speed_timeout: Duration::from_secs(1),
            concurrency: 2,
            buffer_size: 1024,
            max_download_bytes: 4096,
        }
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let cfg = ProbeConfig {
            concurrency: 0,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(ProbeError::InvalidConfig(_))));
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_test_url() {
        let cfg = ProbeConfig {
            test_urls: Vec::new(),
            ..config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(Progress::new(0, 4).percent, 0.0);
        assert_eq!(Progress::new(1, 4).percent, 25.0);
        assert_eq!(Progress::new(3, 3).percent, 100.0);
        assert_eq!(Progress::new(0, 0).percent, 100.0);
    }
}
