//! Engine configuration.
//!
//! Mirrors the `queue.*` configuration keys described in the design
//! document. Every field has a documented default so a bare `QueueConfig`
//! is usable out of the box; [`QueueConfig::from_env`] layers a handful of
//! environment variables on top when present, but nothing is required.

use crate::error::QueueError;
use crate::retry::BackoffStrategy;
use serde::{Deserialize, Serialize};
use std::env;

fn default_table() -> String {
    "jobs".to_string()
}

fn default_job_timeout() -> u32 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_retry_delay() -> u32 {
    60
}

fn default_cleanup_days() -> u32 {
    7
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_budget_seconds() -> u64 {
    55
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub default_size: usize,
    #[serde(default = "default_batch_budget_seconds")]
    pub default_budget_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_size: default_batch_size(),
            default_budget_seconds: default_batch_budget_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u32,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub default_backoff: BackoffStrategy,
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay: u32,
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u32,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            job_timeout: default_job_timeout(),
            default_max_attempts: default_max_attempts(),
            default_backoff: default_backoff(),
            default_retry_delay: default_retry_delay(),
            cleanup_days: default_cleanup_days(),
            batch: BatchConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Layer `QUEUE_TABLE` and `QUEUE_TIMEOUT` on top of the defaults when
    /// present. `QUEUE_DRIVER` is read by the CLI/binary entry point, not
    /// here, since driver selection picks which crate's driver to
    /// construct rather than a field on this struct.
    pub fn from_env() -> Result<Self, QueueError> {
        let mut config = Self::default();
        if let Ok(table) = env::var("QUEUE_TABLE") {
            config.table = table;
        }
        if let Ok(timeout) = env::var("QUEUE_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                config.job_timeout = timeout;
            }
        }
        validate_table_name(&config.table)?;
        Ok(config)
    }
}

/// Table identifiers are interpolated into SQL (driver crates cannot bind
/// identifiers as query parameters), so they are validated against
/// `^[A-Za-z0-9_]+$` at construction rather than escaped at use.
pub fn validate_table_name(name: &str) -> Result<(), QueueError> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidTable(name.to_string()))
    }
}
