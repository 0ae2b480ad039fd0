use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineTuning;
use crate::model::Ms;

/// All runtime configuration, read once from `SLOTD_*` environment
/// variables at startup. Unparseable values fall back to defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared token clients must present in the hello frame.
    pub token: String,
    pub max_connections: usize,
    /// WAL appends between compaction passes.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Candidate cancellation cutoff, hours before slot start.
    pub cancel_cutoff_hours: i64,
    pub lock_wait: Duration,
    pub lock_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7041,
            data_dir: PathBuf::from("./data"),
            token: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            cancel_cutoff_hours: 24,
            lock_wait: Duration::from_secs(2),
            lock_retries: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: env_or("SLOTD_BIND", d.bind),
            port: env_parsed("SLOTD_PORT").unwrap_or(d.port),
            data_dir: PathBuf::from(env_or("SLOTD_DATA_DIR", "./data".into())),
            token: env_or("SLOTD_TOKEN", d.token),
            max_connections: env_parsed("SLOTD_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: env_parsed("SLOTD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: env_parsed("SLOTD_METRICS_PORT"),
            cancel_cutoff_hours: env_parsed("SLOTD_CANCEL_CUTOFF_HOURS")
                .unwrap_or(d.cancel_cutoff_hours),
            lock_wait: Duration::from_millis(
                env_parsed("SLOTD_LOCK_WAIT_MS").unwrap_or(d.lock_wait.as_millis() as u64),
            ),
            lock_retries: env_parsed("SLOTD_LOCK_RETRIES").unwrap_or(d.lock_retries),
        }
    }

    pub fn tuning(&self) -> EngineTuning {
        EngineTuning {
            lock_wait: self.lock_wait,
            lock_retries: self.lock_retries,
            cancel_cutoff_ms: self.cancel_cutoff_hours as Ms * 3_600_000,
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
