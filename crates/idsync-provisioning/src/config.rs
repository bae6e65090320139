//! Engine configuration.
//!
//! Every value has a default; `IDSYNC_*` environment variables override
//! individual settings.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use idsync_connector::transform::ScriptLimits;

use crate::breaker::BreakerConfig;
use crate::echo::EchoConfig;
use crate::mapping::ValueCacheConfig;
use crate::queue::QueueConfig;
use crate::worker::WorkerConfig;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Sandbox limits for mapping scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_array_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_map_size: usize,
}

fn default_max_operations() -> u64 {
    100_000
}

fn default_max_call_levels() -> usize {
    64
}

fn default_max_string_size() -> usize {
    65_536
}

fn default_max_collection_size() -> usize {
    10_000
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection_size(),
            max_map_size: default_max_collection_size(),
        }
    }
}

impl ScriptConfig {
    #[must_use]
    pub fn limits(&self) -> ScriptLimits {
        ScriptLimits {
            max_operations: self.max_operations,
            max_call_levels: self.max_call_levels,
            max_string_size: self.max_string_size,
            max_array_size: self.max_array_size,
            max_map_size: self.max_map_size,
        }
    }
}

/// All engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub value_cache: ValueCacheConfig,
    #[serde(default)]
    pub script: ScriptConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (defaults in parentheses):
    /// - `IDSYNC_BREAKER_WARNING_THRESHOLD` (3)
    /// - `IDSYNC_BREAKER_BLOCK_THRESHOLD` (5)
    /// - `IDSYNC_BREAKER_INITIAL_BACKOFF_SECS` (60)
    /// - `IDSYNC_BREAKER_MAX_BACKOFF_SECS` (3600)
    /// - `IDSYNC_BREAKER_BACKOFF_MULTIPLIER` (2.0)
    /// - `IDSYNC_BREAKER_PROBE_LEASE_SECS`
    /// - `IDSYNC_ECHO_TTL_SECS` (7200)
    /// - `IDSYNC_CONNECTOR_TIMEOUT_MS` (30000)
    /// - `IDSYNC_SYNC_TIMEOUT_MS` (60000)
    /// - `IDSYNC_RETRY_GRACE_PERIOD_SECS` (300)
    /// - `IDSYNC_SWEEP_PAGE_SIZE` (100)
    /// - `IDSYNC_WORKER_CONCURRENCY` (4)
    /// - `IDSYNC_SWEEP_INTERVAL_SECS` (60)
    /// - `IDSYNC_CHANNEL_CAPACITY` (1024)
    /// - `IDSYNC_VALUE_CACHE_CAPACITY` (10000)
    /// - `IDSYNC_VALUE_CACHE_TTL_SECS` (600)
    /// - `IDSYNC_SCRIPT_MAX_OPERATIONS` (100000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_reader<F>(read: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let b = &mut config.breaker;
        override_with(&read, "IDSYNC_BREAKER_WARNING_THRESHOLD", &mut b.warning_threshold)?;
        override_with(&read, "IDSYNC_BREAKER_BLOCK_THRESHOLD", &mut b.block_threshold)?;
        override_with(&read, "IDSYNC_BREAKER_INITIAL_BACKOFF_SECS", &mut b.initial_backoff_secs)?;
        override_with(&read, "IDSYNC_BREAKER_MAX_BACKOFF_SECS", &mut b.max_backoff_secs)?;
        override_with(&read, "IDSYNC_BREAKER_BACKOFF_MULTIPLIER", &mut b.backoff_multiplier)?;
        override_with(&read, "IDSYNC_BREAKER_PROBE_LEASE_SECS", &mut b.probe_lease_secs)?;

        override_with(&read, "IDSYNC_ECHO_TTL_SECS", &mut config.echo.marker_ttl_secs)?;

        let q = &mut config.queue;
        override_with(&read, "IDSYNC_CONNECTOR_TIMEOUT_MS", &mut q.connector_timeout_ms)?;
        override_with(&read, "IDSYNC_SYNC_TIMEOUT_MS", &mut q.sync_timeout_ms)?;
        override_with(&read, "IDSYNC_RETRY_GRACE_PERIOD_SECS", &mut q.retry_grace_period_secs)?;
        override_with(&read, "IDSYNC_SWEEP_PAGE_SIZE", &mut q.sweep_page_size)?;

        let w = &mut config.worker;
        override_with(&read, "IDSYNC_WORKER_CONCURRENCY", &mut w.concurrency)?;
        override_with(&read, "IDSYNC_SWEEP_INTERVAL_SECS", &mut w.sweep_interval_secs)?;
        override_with(&read, "IDSYNC_CHANNEL_CAPACITY", &mut w.channel_capacity)?;

        let v = &mut config.value_cache;
        override_with(&read, "IDSYNC_VALUE_CACHE_CAPACITY", &mut v.max_capacity)?;
        override_with(&read, "IDSYNC_VALUE_CACHE_TTL_SECS", &mut v.ttl_secs)?;

        override_with(&read, "IDSYNC_SCRIPT_MAX_OPERATIONS", &mut config.script.max_operations)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.breaker;
        if b.block_threshold == 0 {
            return Err(ConfigError::Inconsistent(
                "breaker block threshold must be at least 1".to_string(),
            ));
        }
        if b.warning_threshold >= b.block_threshold {
            return Err(ConfigError::Inconsistent(format!(
                "breaker warning threshold ({}) must be below the block threshold ({})",
                b.warning_threshold, b.block_threshold
            )));
        }
        if b.initial_backoff_secs > b.max_backoff_secs {
            return Err(ConfigError::Inconsistent(format!(
                "initial backoff ({}s) exceeds max backoff ({}s)",
                b.initial_backoff_secs, b.max_backoff_secs
            )));
        }
        if b.backoff_multiplier < 1.0 {
            return Err(ConfigError::Inconsistent(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Inconsistent(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if self.worker.channel_capacity == 0 || self.queue.sweep_page_size == 0 {
            return Err(ConfigError::Inconsistent(
                "channel capacity and sweep page size must be at least 1".to_string(),
            ));
        }
        if self.echo.marker_ttl_secs == 0 {
            return Err(ConfigError::Inconsistent(
                "echo marker TTL must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_with<F, T>(read: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = read(var) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}
