use std::collections::BTreeMap;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CadenceError, Result};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 30_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Priority assigned to every job dispatched through a named queue.
///
/// Lower values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub priority: i32,
}

/// Dispatch engine settings. All durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between poll + run ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Priority used for queues that are referenced by a job but not configured.
    #[serde(default = "default_priority")]
    pub default_priority: i32,
    /// Upper bound on a single `run()` attempt before it counts as failed.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// Upper bound on a single store operation.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Base delay fed into the linear / exponential backoff strategies.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff delays are clamped to this value.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// How long `stop()` waits for in-flight runs before abandoning them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Re-seed jobs whose definition was disabled after exhausting retries.
    #[serde(default)]
    pub reactivate_disabled: bool,
    /// Queue name → priority. `default` is added when missing.
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, QueueConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            default_priority: DEFAULT_PRIORITY,
            job_timeout_ms: DEFAULT_JOB_TIMEOUT_MS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            reactivate_disabled: false,
            queues: default_queues(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Priority for `queue`, falling back to `default_priority` when the queue
    /// is not configured.
    pub fn priority_for(&self, queue: &str) -> i32 {
        self.queues
            .get(queue)
            .map(|q| q.priority)
            .unwrap_or(self.default_priority)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(CadenceError::invalid(
                "scheduler.tick_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.job_timeout_ms == 0 {
            return Err(CadenceError::invalid(
                "scheduler.job_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(CadenceError::invalid(
                "scheduler.store_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(CadenceError::invalid(
                "scheduler.retry_max_delay_ms",
                "must not be smaller than retry_base_delay_ms",
            ));
        }
        if let Some(name) = self.queues.keys().find(|name| name.trim().is_empty()) {
            return Err(CadenceError::invalid(
                "scheduler.queues",
                format!("queue name {name:?} is blank"),
            ));
        }
        Ok(())
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}
fn default_job_timeout_ms() -> u64 {
    DEFAULT_JOB_TIMEOUT_MS
}
fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}
fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}
fn default_retry_max_delay_ms() -> u64 {
    DEFAULT_RETRY_MAX_DELAY_MS
}
fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}
fn default_queues() -> BTreeMap<String, QueueConfig> {
    BTreeMap::from([
        ("high".to_string(), QueueConfig { priority: 0 }),
        (DEFAULT_QUEUE.to_string(), QueueConfig { priority: DEFAULT_PRIORITY }),
        ("low".to_string(), QueueConfig { priority: 10 }),
    ])
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; defaults apply. Nested keys in env
    /// vars are separated by `__`, e.g. `CADENCE_SCHEDULER__TICK_INTERVAL_MS`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading configuration");

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CADENCE_").split("__")),
        )
    }

    /// Extract, normalise and validate a config from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: CadenceConfig = figment
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Guarantee the `default` queue exists so unqueued jobs always have a home.
    pub fn normalize(&mut self) {
        let fallback = self.scheduler.default_priority;
        self.scheduler
            .queues
            .entry(DEFAULT_QUEUE.to_string())
            .or_insert(QueueConfig { priority: fallback });
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(CadenceError::invalid("database.path", "must not be empty"));
        }
        self.scheduler.validate()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Result<CadenceConfig> {
        CadenceConfig::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = from_toml("").expect("defaults should be valid");
        assert_eq!(config.scheduler.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.scheduler.priority_for("high"), 0);
        assert_eq!(config.scheduler.priority_for("low"), 10);
        assert!(config.database.path.ends_with("cadence.db"));
    }

    #[test]
    fn custom_queues_replace_builtins_but_keep_default() {
        let config = from_toml(
            r#"
            [scheduler]
            default_priority = 7

            [scheduler.queues]
            critical = { priority = 1 }
            "#,
        )
        .expect("valid config");

        assert_eq!(config.scheduler.priority_for("critical"), 1);
        // default queue is injected using default_priority
        assert_eq!(config.scheduler.priority_for(DEFAULT_QUEUE), 7);
        // unconfigured queues fall back
        assert_eq!(config.scheduler.priority_for("high"), 7);
        assert_eq!(config.scheduler.queues.len(), 2);
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        let err = from_toml("[scheduler]\ntick_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, CadenceError::InvalidConfig { ref field, .. } if field == "scheduler.tick_interval_ms"));
    }

    #[test]
    fn empty_database_path_is_rejected() {
        let err = from_toml("[database]\npath = \"  \"\n").unwrap_err();
        assert!(matches!(err, CadenceError::InvalidConfig { ref field, .. } if field == "database.path"));
    }

    #[test]
    fn malformed_value_is_config_error() {
        let err = from_toml("[scheduler]\ntick_interval_ms = \"soon\"\n").unwrap_err();
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn max_delay_below_base_is_rejected() {
        let err = from_toml(
            "[scheduler]\nretry_base_delay_ms = 5000\nretry_max_delay_ms = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry_max_delay_ms"));
    }
}
