//! Dispatch configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) yields a working setup.

use crate::error::{DispatchError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings for the dispatch subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub tasks: TaskConfig,

    #[serde(default)]
    pub consumers: ConsumerRefreshConfig,

    /// Default retry policy for consumers that don't carry their own
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Maximum dead letters kept in memory (0 = unbounded)
    #[serde(default = "default_dlq_capacity")]
    pub dlq_capacity: usize,
}

/// Delivery worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_workers")]
    pub worker_count: usize,

    /// Events routed and deliveries attempted per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Webhook timeout when the consumer doesn't set one
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Events left `routed` and deliveries left `delivering` longer than
    /// this are reclaimed by the recovery sweep
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
}

/// Background task worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_task_workers")]
    pub worker_count: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single handler run
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Running tasks claimed longer ago than this are requeued
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Consumer snapshot refresh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRefreshConfig {
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_dlq_capacity() -> usize {
    10_000
}

fn default_delivery_workers() -> usize {
    4
}

fn default_task_workers() -> usize {
    2
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    format!("a3s-dispatch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_handler_timeout_ms() -> u64 {
    60_000
}

fn default_lease_timeout_ms() -> u64 {
    300_000
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: default_delivery_workers(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            worker_count: default_task_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl TaskConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

impl Default for ConsumerRefreshConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl ConsumerRefreshConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl DispatchConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: DispatchConfig = toml::from_str(src)
            .map_err(|e| DispatchError::Config(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&src)
            .map_err(|e| DispatchError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery.worker_count == 0 {
            return Err(DispatchError::Config(
                "delivery.worker_count must be >= 1".to_string(),
            ));
        }
        if self.delivery.batch_size == 0 {
            return Err(DispatchError::Config(
                "delivery.batch_size must be >= 1".to_string(),
            ));
        }
        if self.delivery.request_timeout_ms == 0 {
            return Err(DispatchError::Config(
                "delivery.request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.delivery.lease_timeout_ms <= self.delivery.request_timeout_ms {
            return Err(DispatchError::Config(format!(
                "delivery.lease_timeout_ms ({}) must exceed delivery.request_timeout_ms ({})",
                self.delivery.lease_timeout_ms, self.delivery.request_timeout_ms
            )));
        }
        if self.tasks.worker_count == 0 {
            return Err(DispatchError::Config(
                "tasks.worker_count must be >= 1".to_string(),
            ));
        }
        if self.tasks.lease_timeout_ms <= self.tasks.handler_timeout_ms {
            return Err(DispatchError::Config(format!(
                "tasks.lease_timeout_ms ({}) must exceed tasks.handler_timeout_ms ({})",
                self.tasks.lease_timeout_ms, self.tasks.handler_timeout_ms
            )));
        }
        self.retry
            .validate()
            .map_err(|e| DispatchError::Config(format!("retry: {}", e)))?;
        self.tasks
            .retry
            .validate()
            .map_err(|e| DispatchError::Config(format!("tasks.retry: {}", e)))?;
        Ok(())
    }
}
