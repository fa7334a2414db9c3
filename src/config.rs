use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::transport::OverflowPolicy;

pub const CONFIG_PATH_VAR: &str = "OOMWATCH_CONFIG";
const ENV_PREFIX: &str = "OOMWATCH_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    Env { key: String, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Transport slots between producers and the consumer loop.
    pub ring_buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Longest an event waits on enrichment before going out as partial.
    pub enrichment_timeout_ms: u64,
    pub enrichment_workers: usize,
    /// Default per-subscriber backlog.
    pub subscriber_queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub drain_deadline_ms: u64,
    pub signal_history: usize,
    /// Cadence of the live metrics log line in the daemon.
    pub metrics_interval_ms: u64,
    pub page_size: u64,
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ring_buffer_capacity: 1024,
            overflow_policy: OverflowPolicy::DropNewest,
            enrichment_timeout_ms: 250,
            enrichment_workers: 4,
            subscriber_queue_capacity: 256,
            poll_interval_ms: 100,
            drain_deadline_ms: 1000,
            signal_history: 1024,
            metrics_interval_ms: 10_000,
            page_size: 4096,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl WatcherConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File named by `OOMWATCH_CONFIG` (if any), then `OOMWATCH_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `lookup` receives full variable names, e.g. `OOMWATCH_RING_BUFFER_CAPACITY`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("RING_BUFFER_CAPACITY") {
            self.ring_buffer_capacity = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("OVERFLOW_POLICY") {
            self.overflow_policy = parse_policy(&key, &value)?;
        }
        if let Some((key, value)) = get("ENRICHMENT_TIMEOUT_MS") {
            self.enrichment_timeout_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("ENRICHMENT_WORKERS") {
            self.enrichment_workers = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SUBSCRIBER_QUEUE_CAPACITY") {
            self.subscriber_queue_capacity = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("DRAIN_DEADLINE_MS") {
            self.drain_deadline_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SIGNAL_HISTORY") {
            self.signal_history = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("METRICS_INTERVAL_MS") {
            self.metrics_interval_ms = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("PAGE_SIZE") {
            self.page_size = parse(&key, &value)?;
        }
        if let Some((_, value)) = get("CGROUP_ROOT") {
            self.cgroup_root = PathBuf::from(value);
        }
        if let Some((_, value)) = get("PROC_ROOT") {
            self.proc_root = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("ring_buffer_capacity", self.ring_buffer_capacity as u64),
            ("enrichment_timeout_ms", self.enrichment_timeout_ms),
            ("enrichment_workers", self.enrichment_workers as u64),
            ("subscriber_queue_capacity", self.subscriber_queue_capacity as u64),
            ("poll_interval_ms", self.poll_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("page_size", self.page_size),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Zero(*name)),
            None => Ok(()),
        }
    }

    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_policy(key: &str, value: &str) -> Result<OverflowPolicy, ConfigError> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "drop_newest" => Ok(OverflowPolicy::DropNewest),
        "overwrite_oldest" => Ok(OverflowPolicy::OverwriteOldest),
        _ => Err(ConfigError::Env {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
