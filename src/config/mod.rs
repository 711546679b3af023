//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing or the
//! scheduler table is out of range.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Hard ceiling on concurrently armed records in the managed backend.
pub const MAX_MANAGED_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// `BACKWORK_CONFIG` may point at a TOML file with a `[scheduler]` table.
    pub fn from_env() -> Result<Self> {
        let scheduler = match std::env::var("BACKWORK_CONFIG") {
            Ok(path) => SchedulerConfig::from_file(path)?,
            Err(_) => SchedulerConfig::default(),
        };

        Ok(Self {
            database_path: PathBuf::from(required_var("BACKWORK_DATABASE")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            scheduler,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    scheduler: SchedulerConfig,
}

/// Scheduling limits and policies. Durations are whole seconds in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global cap on RUNNING records.
    pub max_concurrent_running: usize,
    /// Slots in the managed backend.
    pub managed_capacity: usize,
    /// Attempt limit for records that do not set one.
    pub default_max_attempts: u32,
    #[serde(rename = "min_backoff_secs", deserialize_with = "secs")]
    pub min_backoff: Duration,
    #[serde(rename = "max_backoff_secs", deserialize_with = "secs")]
    pub max_backoff: Duration,
    /// A RUNNING record with no result after this long is treated as faulted.
    #[serde(rename = "execution_timeout_secs", deserialize_with = "secs")]
    pub execution_timeout: Duration,
    /// Timeout sweep, storage health check and re-arm of deferred records.
    #[serde(rename = "poll_interval_secs", deserialize_with = "secs")]
    pub poll_interval: Duration,
    #[serde(rename = "min_periodic_interval_secs", deserialize_with = "secs")]
    pub min_periodic_interval: Duration,
    #[serde(rename = "min_periodic_flex_secs", deserialize_with = "secs")]
    pub min_periodic_flex: Duration,
    /// Bound on serialized input and output payloads.
    pub max_data_bytes: usize,
    /// Terminal records older than this are removed by `prune`.
    #[serde(rename = "prune_retention_secs", deserialize_with = "secs")]
    pub prune_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_running: 4,
            managed_capacity: 20,
            default_max_attempts: 10,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(5 * 60 * 60),
            execution_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(30),
            min_periodic_interval: Duration::from_secs(15 * 60),
            min_periodic_flex: Duration::from_secs(5 * 60),
            max_data_bytes: 10 * 1024,
            prune_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        file.scheduler.validate()?;
        Ok(file.scheduler)
    }

    pub fn validate(&self) -> Result<()> {
        if self.managed_capacity == 0 || self.managed_capacity > MAX_MANAGED_CAPACITY {
            return Err(Error::Config(format!(
                "managed_capacity must be between 1 and {MAX_MANAGED_CAPACITY}, got {}",
                self.managed_capacity
            )));
        }
        if self.max_concurrent_running == 0 {
            return Err(Error::Config(
                "max_concurrent_running must be at least 1".to_string(),
            ));
        }
        if self.default_max_attempts == 0 {
            return Err(Error::Config(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.min_backoff > self.max_backoff {
            return Err(Error::Config(
                "min_backoff_secs exceeds max_backoff_secs".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.execution_timeout.is_zero() {
            return Err(Error::Config(
                "poll_interval_secs and execution_timeout_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
