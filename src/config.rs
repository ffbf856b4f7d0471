//! TOML configuration for nodepulse.
//!
//! Layered model: an explicit path, then the `NODEPULSE_CONFIG` environment
//! variable, then `/etc/nodepulse/nodepulse.toml`, then compiled-in defaults.
//! Every section falls back to its defaults when omitted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::probes::ProbeConfig;

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "NODEPULSE_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/nodepulse/nodepulse.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the nodepulse process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded nodepulse configuration");
        Ok(config)
    }

    /// Resolve configuration for the process.
    ///
    /// An explicit path must load. Otherwise `NODEPULSE_CONFIG` and then the
    /// system path are tried in turn; a broken candidate is logged and
    /// skipped, and with none left the compiled-in defaults apply.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        let candidates = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .into_iter()
            .chain(system.exists().then_some(system));
        for path in candidates {
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unusable config file"),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where the node/subscription/task snapshot is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/nodepulse.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wall-clock deadline applied to every task execution (seconds).
    pub task_timeout_secs: u64,
    /// Install the default refresh/test tasks when the store holds none.
    pub seed_default_tasks: bool,
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: 600,
            seed_default_tasks: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Probe engine tuning, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Nodes slower than this to connect skip the download test (ms).
    pub max_latency_ms: u32,
    /// Download test URLs, primary first, then fallback mirrors.
    pub test_urls: Vec<String>,
    /// Per-node TCP connect deadline (ms).
    pub latency_timeout_ms: u64,
    /// Per-node download deadline (seconds).
    pub speed_timeout_secs: u64,
    /// Maximum number of node tests in flight.
    pub concurrency: usize,
    /// Read buffer size for the download test (bytes).
    pub buffer_size: usize,
    /// Stop the download after this many bytes.
    pub max_download_bytes: u64,
    /// HTTP connect timeout for the pooled client (seconds).
    pub connect_timeout_secs: u64,
    /// Idle pooled connections are closed after this long (seconds).
    pub idle_timeout_secs: u64,
    /// Maximum idle pooled connections per host.
    pub max_idle_per_host: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_latency_ms: 400,
            test_urls: vec![
                "http://cachefly.cachefly.net/100mb.test".to_string(),
                "http://speedtest.tele2.net/100MB.zip".to_string(),
            ],
            latency_timeout_ms: 5_000,
            speed_timeout_secs: 30,
            concurrency: 5,
            buffer_size: 8192,
            max_download_bytes: 10 * 1024 * 1024,
            connect_timeout_secs: 10,
            idle_timeout_secs: 90,
            max_idle_per_host: 100,
        }
    }
}

impl ProbeSettings {
    /// Convert into the engine's per-batch config.
    pub fn to_probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            max_latency_ms: self.max_latency_ms,
            test_urls: self.test_urls.clone(),
            latency_timeout: Duration::from_millis(self.latency_timeout_ms),
            speed_timeout: Duration::from_secs(self.speed_timeout_secs),
            concurrency: self.concurrency,
            buffer_size: self.buffer_size,
            max_download_bytes: self.max_download_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Thresholds a tested node must meet to be "current" (usable).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Upper latency bound (ms).
    pub max_latency_ms: u32,
    /// Lower download speed bound (MB/s).
    pub min_speed: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 400,
            min_speed: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Overall timeout for fetching one subscription URL (seconds).
    pub fetch_timeout_secs: u64,
}

impl SubscriptionConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.storage.path, PathBuf::from("data/nodepulse.db"));
        assert_eq!(cfg.scheduler.task_timeout_secs, 600);
        assert!(cfg.scheduler.seed_default_tasks);
        assert_eq!(cfg.probe.max_latency_ms, 400);
        assert_eq!(cfg.probe.test_urls.len(), 2);
        assert_eq!(cfg.probe.concurrency, 5);
        assert_eq!(cfg.probe.buffer_size, 8192);
        assert_eq!(cfg.filter.max_latency_ms, 400);
        assert_eq!(cfg.filter.min_speed, 1.0);
        assert_eq!(cfg.subscription.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[storage]
path = "/var/lib/nodepulse/state.db"

[scheduler]
task_timeout_secs = 120
seed_default_tasks = false

[probe]
max_latency_ms = 250
test_urls = ["http://mirror.example/10mb.bin"]
latency_timeout_ms = 1500
concurrency = 16

[filter]
max_latency_ms = 300
min_speed = 2.5

[logging]
level = "debug"
json = true
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.storage.path, PathBuf::from("/var/lib/nodepulse/state.db"));
        assert_eq!(cfg.scheduler.task_timeout(), Duration::from_secs(120));
        assert!(!cfg.scheduler.seed_default_tasks);
        assert_eq!(cfg.probe.max_latency_ms, 250);
        assert_eq!(cfg.probe.test_urls, vec!["http://mirror.example/10mb.bin"]);
        assert_eq!(cfg.probe.concurrency, 16);
        // Unset probe fields keep their defaults.
        assert_eq!(cfg.probe.buffer_size, 8192);
        assert_eq!(cfg.filter.min_speed, 2.5);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        let defaults = AppConfig::default();

        assert_eq!(cfg.storage.path, defaults.storage.path);
        assert_eq!(cfg.probe.test_urls, defaults.probe.test_urls);
        assert_eq!(cfg.scheduler.task_timeout_secs, defaults.scheduler.task_timeout_secs);
    }

    #[test]
    fn test_probe_settings_convert() {
        let probe = ProbeSettings::default().to_probe_config();
        assert_eq!(probe.latency_timeout, Duration::from_secs(5));
        assert_eq!(probe.speed_timeout, Duration::from_secs(30));
        assert_eq!(probe.max_download_bytes, 10 * 1024 * 1024);
        assert!(probe.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nodepulse.toml");
        std::fs::write(&path, "[probe]\nconcurrency = 3\n").unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.probe.concurrency, 3);
    }

    #[test]
    fn test_env_config_is_used_and_broken_one_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = dir.path().join("good.toml");
        std::fs::write(&good, "[probe]\nconcurrency = 7\n").unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[probe\n").unwrap();

        std::env::set_var(CONFIG_ENV, &good);
        let cfg = AppConfig::resolve(None).unwrap();
        assert_eq!(cfg.probe.concurrency, 7);

        std::env::set_var(CONFIG_ENV, &bad);
        let fallback = AppConfig::resolve(None);
        std::env::remove_var(CONFIG_ENV);
        assert!(fallback.is_ok());
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = AppConfig::resolve(Some(Path::new("/nonexistent/nodepulse.toml")));
        assert!(result.is_err());
    }
}
