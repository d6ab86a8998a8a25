use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix of every environment key read by [`RuntimeConfig::from_env`].
pub const ENV_PREFIX: &str = "EXTKIT";

/// Upper bound for every configured interval, in seconds (one year).
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, key))
        .ok()
        .filter(|s| !s.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Runtime settings for the scheduler, worker pool and flush pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of concurrently executing callbacks.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Scheduler tick granularity in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Interval between buffer flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Interval between status heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Interval of the primary `query` task.
    #[serde(default = "default_query_interval")]
    pub query_interval_secs: u64,
    /// Maximum number of encoded lines held between flushes.
    #[serde(default = "default_max_pending_lines")]
    pub max_pending_lines: usize,
    /// How long in-flight callbacks may run after a shutdown signal.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Consecutive failed flushes before the status turns into a connection error.
    #[serde(default = "default_max_send_failures")]
    pub max_send_failures: u32,
    /// Identity of the monitoring configuration, attached to self-monitoring data.
    #[serde(default = "default_monitoring_config_id")]
    pub monitoring_config_id: String,
    #[serde(default)]
    pub extension_name: String,
    #[serde(default = "default_extension_version")]
    pub extension_version: String,
    /// Base URL of the ingestion endpoint. `None` selects the debug client.
    #[serde(default)]
    pub ingest_url: Option<String>,
    #[serde(default = "default_datasource_id")]
    pub datasource_id: String,
}

fn default_worker_threads() -> usize { 10 }
fn default_tick_interval_ms() -> u64 { 1000 }
fn default_flush_interval() -> u64 { 30 }
fn default_heartbeat_interval() -> u64 { 30 }
fn default_query_interval() -> u64 { 60 }
fn default_max_pending_lines() -> usize { 100_000 }
fn default_shutdown_grace() -> u64 { 10 }
fn default_max_send_failures() -> u32 { 3 }
fn default_monitoring_config_id() -> String { "development_config_id".into() }
fn default_extension_version() -> String { "0.0.0".into() }
fn default_datasource_id() -> String { "development_task_id".into() }

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            tick_interval_ms: default_tick_interval_ms(),
            flush_interval_secs: default_flush_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            query_interval_secs: default_query_interval(),
            max_pending_lines: default_max_pending_lines(),
            shutdown_grace_secs: default_shutdown_grace(),
            max_send_failures: default_max_send_failures(),
            monitoring_config_id: default_monitoring_config_id(),
            extension_name: String::new(),
            extension_version: default_extension_version(),
            ingest_url: None,
            datasource_id: default_datasource_id(),
        }
    }
}

impl RuntimeConfig {
    /// Build config from `EXTKIT_*` environment variables (call `load_dotenv()` first).
    /// Unset or unparsable keys fall back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            worker_threads: env_parse("WORKER_THREADS", d.worker_threads),
            tick_interval_ms: env_parse("TICK_INTERVAL_MS", d.tick_interval_ms),
            flush_interval_secs: env_parse("FLUSH_INTERVAL_SECS", d.flush_interval_secs),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS", d.heartbeat_interval_secs),
            query_interval_secs: env_parse("QUERY_INTERVAL_SECS", d.query_interval_secs),
            max_pending_lines: env_parse("MAX_PENDING_LINES", d.max_pending_lines),
            shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", d.shutdown_grace_secs),
            max_send_failures: env_parse("MAX_SEND_FAILURES", d.max_send_failures),
            monitoring_config_id: env_or("MONITORING_CONFIG_ID", &d.monitoring_config_id),
            extension_name: env_or("EXTENSION_NAME", &d.extension_name),
            extension_version: env_or("EXTENSION_VERSION", &d.extension_version),
            ingest_url: env_opt("INGEST_URL"),
            datasource_id: env_or("DATASOURCE_ID", &d.datasource_id),
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.max_pending_lines == 0 {
            return Err(ConfigError::Invalid("max_pending_lines must be at least 1".into()));
        }
        let intervals = [
            ("tick_interval_ms", self.tick_interval_ms / 1000, self.tick_interval_ms),
            ("flush_interval_secs", self.flush_interval_secs, self.flush_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs, self.heartbeat_interval_secs),
            ("query_interval_secs", self.query_interval_secs, self.query_interval_secs),
        ];
        for (name, secs, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{name} exceeds the maximum of {MAX_INTERVAL_SECS} seconds"
                )));
            }
        }
        if self.shutdown_grace_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "shutdown_grace_secs exceeds the maximum of {MAX_INTERVAL_SECS} seconds"
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs(self.query_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Runtime config:");
        tracing::info!("  workers:   {}", self.worker_threads);
        tracing::info!("  tick:      {}ms", self.tick_interval_ms);
        tracing::info!("  flush:     every {}s, max {} pending lines", self.flush_interval_secs, self.max_pending_lines);
        tracing::info!("  heartbeat: every {}s", self.heartbeat_interval_secs);
        tracing::info!("  query:     every {}s", self.query_interval_secs);
        tracing::info!("  ingest:    {}", self.ingest_url.as_deref().unwrap_or("(debug client)"));
        tracing::info!("  config id: {}", self.monitoring_config_id);
    }
}
