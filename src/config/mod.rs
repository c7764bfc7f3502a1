//! # Worker Configuration
//!
//! Layered configuration built with the `config` crate:
//!
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed `MPC_JOBS`, `__` between levels
//!    (`MPC_JOBS__RETRY__MAX_RETRIES=5`)
//!
//! ```toml
//! [worker]
//! node_id = "worker-a"
//! queue_name = "mpc_jobs"
//!
//! [retry]
//! max_retries = 3
//! base_delay_seconds = 60.0
//!
//! [timeouts]
//! soft_time_limit_seconds = 3600.0
//! hard_time_limit_seconds = 3900.0
//!
//! [devices]
//! party_failure_policy = "fail_fast"
//! ```

use crate::error::{ConfigResult, ConfigurationError};
use crate::resources::{PartyDeviceConfig, PartyFailurePolicy};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MPC_JOBS";

/// Upper bound for every duration setting (one year).
pub const MAX_DURATION_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

/// Complete worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker: WorkerSettings,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub devices: DeviceSettings,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker identity reported in status events
    pub node_id: String,
    pub queue_name: String,
    /// Sleep between polls of an empty queue
    pub poll_interval_ms: u64,
    /// How long a received message stays hidden from other consumers
    pub visibility_timeout_seconds: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            node_id: format!("worker-{}", std::process::id()),
            queue_name: "mpc_jobs".to_string(),
            poll_interval_ms: 1000,
            visibility_timeout_seconds: 4200.0,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> ConfigResult<Duration> {
        seconds("worker.visibility_timeout_seconds", self.visibility_timeout_seconds)
    }
}

/// Exponential backoff settings for retryable failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Jitter as a fraction of the delay (0.0 to 1.0)
    pub max_jitter: f64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> ConfigResult<Duration> {
        seconds("retry.base_delay_seconds", self.base_delay_seconds)
    }

    pub fn max_delay(&self) -> ConfigResult<Duration> {
        seconds("retry.max_delay_seconds", self.max_delay_seconds)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_seconds: 60.0,
            max_delay_seconds: 600.0,
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub soft_time_limit_seconds: f64,
    pub hard_time_limit_seconds: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            soft_time_limit_seconds: 3600.0,
            hard_time_limit_seconds: 3900.0,
        }
    }
}

impl TimeoutConfig {
    pub fn soft_limit(&self) -> ConfigResult<Duration> {
        seconds("timeouts.soft_time_limit_seconds", self.soft_time_limit_seconds)
    }

    pub fn hard_limit(&self) -> ConfigResult<Duration> {
        seconds("timeouts.hard_time_limit_seconds", self.hard_time_limit_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub party_devices_enabled: bool,
    pub party_failure_policy: PartyFailurePolicy,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            party_devices_enabled: true,
            party_failure_policy: PartyFailurePolicy::Omit,
        }
    }
}

impl DeviceSettings {
    pub fn party_config(&self) -> PartyDeviceConfig {
        PartyDeviceConfig {
            enabled: self.party_devices_enabled,
            failure_policy: self.party_failure_policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Also append status events to this JSON-lines file
    pub json_lines_path: Option<PathBuf>,
    pub channel_capacity: usize,
    /// Tasks whose events the in-memory channel keeps
    pub retained_tasks: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            json_lines_path: None,
            channel_capacity: crate::events::DEFAULT_CHANNEL_CAPACITY,
            retained_tasks: crate::events::DEFAULT_RETAINED_TASKS,
        }
    }
}

impl WorkerConfig {
    /// Load defaults, then `path` if given, then `MPC_JOBS__*` variables.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        Self::load_with_environment(path, default_environment())
    }

    /// Like [`WorkerConfig::load`] with an explicit environment source.
    pub fn load_with_environment(path: Option<&Path>, environment: Environment) -> ConfigResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&WorkerConfig::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading worker configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let config: WorkerConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.queue_name.trim().is_empty() {
            return Err(ConfigurationError::invalid_value("worker.queue_name", "must not be empty"));
        }
        if self.worker.node_id.trim().is_empty() {
            return Err(ConfigurationError::invalid_value("worker.node_id", "must not be empty"));
        }

        let retry = &self.retry;
        if !(0.0..=1.0).contains(&retry.max_jitter) {
            return Err(ConfigurationError::invalid_value(
                "retry.max_jitter",
                format!("{} is outside [0, 1]", retry.max_jitter),
            ));
        }
        if retry.max_delay()? < retry.base_delay()? {
            return Err(ConfigurationError::invalid_value(
                "retry.max_delay_seconds",
                "must be at least base_delay_seconds",
            ));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.multiplier",
                format!("{} is not a finite value of at least 1.0", retry.multiplier),
            ));
        }

        let timeouts = &self.timeouts;
        if timeouts.soft_limit()?.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "timeouts.soft_time_limit_seconds",
                "must be positive",
            ));
        }
        if timeouts.hard_limit()? <= timeouts.soft_limit()? {
            return Err(ConfigurationError::invalid_value(
                "timeouts.hard_time_limit_seconds",
                "must be greater than the soft time limit",
            ));
        }
        if self.worker.visibility_timeout()? < timeouts.hard_limit()? {
            return Err(ConfigurationError::invalid_value(
                "worker.visibility_timeout_seconds",
                "must be at least the hard time limit",
            ));
        }

        if self.status.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value("status.channel_capacity", "must be positive"));
        }
        if self.status.retained_tasks == 0 {
            return Err(ConfigurationError::invalid_value("status.retained_tasks", "must be positive"));
        }
        Ok(())
    }
}

/// Convert a seconds setting, rejecting values a [`Duration`] cannot hold.
fn seconds(field: &str, value: f64) -> ConfigResult<Duration> {
    if !(0.0..=MAX_DURATION_SECONDS).contains(&value) {
        return Err(ConfigurationError::invalid_value(
            field,
            format!("{value} is outside [0, {MAX_DURATION_SECONDS}] seconds"),
        ));
    }
    Duration::try_from_secs_f64(value).map_err(|e| ConfigurationError::invalid_value(field, e.to_string()))
}

fn default_environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
