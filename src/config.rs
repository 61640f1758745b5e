//! Daemon configuration.
//!
//! Every knob has a default matching the original service deployment and can
//! be overridden via a `SANDBOX_EXECD_*` environment variable or a JSON
//! config file passed on the command line.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base image sandboxes are created from.
    pub container_image: String,

    /// CPU quota in microseconds per scheduling period.
    pub cpu_quota: i64,

    /// CPU scheduling period in microseconds.
    pub cpu_period: i64,

    /// Memory ceiling per sandbox, in megabytes.
    pub memory_mb: u64,

    /// Wall-clock bound for a single execution, in seconds.
    pub exec_timeout_seconds: u64,

    /// Number of warm idle sandboxes the pool tries to keep ready.
    pub pool_target_size: usize,

    /// Maximum sandbox acquisition attempts for transient engine errors.
    pub acquire_max_attempts: u32,

    /// Initial backoff between acquisition attempts, in milliseconds.
    /// Doubles on each subsequent attempt.
    pub acquire_backoff_ms: u64,

    /// Interval between periodic reaper sweeps, in seconds.
    pub reaper_interval_seconds: u64,

    /// How long a completed or failed session is kept before the reaper
    /// marks it cleaned up, in seconds.
    pub session_retention_seconds: u64,

    /// How long a cleaned-up session record stays in the table before it is
    /// purged, in seconds.
    pub purge_after_seconds: u64,

    /// Hard bound on how long a sandbox may sit reserved or executing
    /// before the reaper force-retires it, in seconds.
    pub sandbox_busy_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_image: "python:3.13-slim".to_string(),
            cpu_quota: 50_000,
            cpu_period: 100_000,
            memory_mb: 128,
            exec_timeout_seconds: 10,
            pool_target_size: 1,
            acquire_max_attempts: 3,
            acquire_backoff_ms: 200,
            reaper_interval_seconds: 5,
            session_retention_seconds: 300,
            purge_after_seconds: 300,
            sandbox_busy_timeout_seconds: 120,
        }
    }
}

macro_rules! env_override {
    ($cfg:expr, $field:ident, $var:expr) => {
        if let Ok(raw) = std::env::var($var) {
            if let Ok(value) = raw.parse() {
                $cfg.$field = value;
            } else {
                tracing::warn!(var = $var, value = %raw, "Ignoring unparseable env override");
            }
        }
    };
}

impl Config {
    /// Build a config from defaults plus `SANDBOX_EXECD_*` env overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(image) = std::env::var("SANDBOX_EXECD_IMAGE") {
            cfg.container_image = image;
        }
        env_override!(cfg, cpu_quota, "SANDBOX_EXECD_CPU_QUOTA");
        env_override!(cfg, cpu_period, "SANDBOX_EXECD_CPU_PERIOD");
        env_override!(cfg, memory_mb, "SANDBOX_EXECD_MEMORY_MB");
        env_override!(cfg, exec_timeout_seconds, "SANDBOX_EXECD_EXEC_TIMEOUT");
        env_override!(cfg, pool_target_size, "SANDBOX_EXECD_POOL_SIZE");
        env_override!(cfg, acquire_max_attempts, "SANDBOX_EXECD_ACQUIRE_ATTEMPTS");
        env_override!(cfg, acquire_backoff_ms, "SANDBOX_EXECD_ACQUIRE_BACKOFF_MS");
        env_override!(cfg, reaper_interval_seconds, "SANDBOX_EXECD_REAPER_INTERVAL");
        env_override!(cfg, session_retention_seconds, "SANDBOX_EXECD_SESSION_RETENTION");
        env_override!(cfg, purge_after_seconds, "SANDBOX_EXECD_PURGE_AFTER");
        env_override!(
            cfg,
            sandbox_busy_timeout_seconds,
            "SANDBOX_EXECD_BUSY_TIMEOUT"
        );
        cfg
    }

    /// Load a config from a JSON file, applying defaults for absent fields.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub const fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_seconds)
    }

    pub const fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }

    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub const fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_seconds)
    }

    pub const fn purge_after(&self) -> Duration {
        Duration::from_secs(self.purge_after_seconds)
    }

    pub const fn sandbox_busy_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_busy_timeout_seconds)
    }

    #[allow(clippy::cast_possible_wrap)]
    pub const fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }
}
