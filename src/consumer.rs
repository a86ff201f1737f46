//! Consumer configuration boundary
//!
//! Consumer configurations are owned by client management. The core only
//! reads them through a `ConsumerSource` and routes against an immutable
//! `ConsumerSnapshot` that a `SnapshotRefresher` replaces periodically.

use crate::error::{DispatchError, Result};
use crate::retry::RetryPolicy;
use crate::time::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where a consumer wants its events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeliveryTarget {
    /// HTTP POST of the event envelope
    #[serde(rename_all = "camelCase")]
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        /// HMAC-SHA256 signing secret
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        /// Per-attempt timeout override
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Enqueue an internal background task of the given kind
    Task { kind: String },
}

impl DeliveryTarget {
    /// Plain webhook target without headers or signing
    pub fn webhook(url: impl Into<String>) -> Self {
        Self::Webhook {
            url: url.into(),
            headers: HashMap::new(),
            secret: None,
            timeout_ms: None,
        }
    }

    /// Internal task target
    pub fn task(kind: impl Into<String>) -> Self {
        Self::Task { kind: kind.into() }
    }
}

impl std::fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryTarget::Webhook { url, .. } => write!(f, "webhook:{}", url),
            DeliveryTarget::Task { kind } => write!(f, "task:{}", kind),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A configured destination interested in some event types of a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    /// Unique consumer identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Tenant/client this consumer belongs to
    pub tenant: String,

    /// Client channel; `None` means tenant-wide
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Event type filters: exact (`chat.feedback`), prefix (`chat.*`), or `*`
    pub event_types: Vec<String>,

    pub target: DeliveryTarget,

    /// Retry policy; `None` falls back to the dispatcher default at routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ConsumerConfig {
    /// Create an enabled, tenant-wide consumer without its own retry policy
    pub fn new(
        id: impl Into<String>,
        tenant: impl Into<String>,
        event_types: Vec<String>,
        target: DeliveryTarget,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tenant: tenant.into(),
            channel: None,
            event_types,
            target,
            retry: None,
            enabled: true,
        }
    }

    /// Scope the consumer to a client channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Effective retry policy, using the built-in default when unset
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    /// Enable or disable the consumer
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether any of the consumer's filters accepts `event_type`
    pub fn accepts(&self, event_type: &str) -> bool {
        self.event_types
            .iter()
            .any(|pattern| matches_event_type(event_type, pattern))
    }

    /// Check the delivery target, returning a `Configuration` error if malformed
    pub fn validate_target(&self) -> Result<()> {
        let reason = match &self.target {
            DeliveryTarget::Webhook {
                url,
                headers,
                timeout_ms,
                ..
            } => match reqwest::Url::parse(url) {
                Ok(parsed) if !matches!(parsed.scheme(), "http" | "https") => {
                    Some(format!("unsupported webhook scheme '{}'", parsed.scheme()))
                }
                Ok(parsed) if parsed.host_str().is_none() => {
                    Some(format!("webhook url '{}' has no host", url))
                }
                Ok(_) if *timeout_ms == Some(0) => Some("timeout_ms must be > 0".to_string()),
                Ok(_) => invalid_header(headers),
                Err(e) => Some(format!("invalid webhook url '{}': {}", url, e)),
            },
            DeliveryTarget::Task { kind } if kind.trim().is_empty() => {
                Some("task kind cannot be empty".to_string())
            }
            DeliveryTarget::Task { .. } => None,
        };

        match reason {
            Some(reason) => Err(DispatchError::Configuration {
                consumer_id: self.id.clone(),
                reason,
            }),
            None => match &self.retry {
                Some(retry) => retry.validate().map_err(|reason| DispatchError::Configuration {
                    consumer_id: self.id.clone(),
                    reason,
                }),
                None => Ok(()),
            },
        }
    }
}

/// First custom header that could never be sent, as an error message
fn invalid_header(headers: &HashMap<String, String>) -> Option<String> {
    let mut names: Vec<&String> = headers.keys().collect();
    names.sort();
    names.into_iter().find_map(|name| {
        if let Err(e) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) {
            return Some(format!("invalid header name '{}': {}", name, e));
        }
        reqwest::header::HeaderValue::from_str(&headers[name])
            .err()
            .map(|e| format!("invalid value for header '{}': {}", name, e))
    })
}

/// Match an event type against a consumer filter
///
/// - exact: `chat.feedback`
/// - prefix wildcard: `chat.*` matches `chat.feedback`, not `chatter.x`
/// - catch-all: `*`
pub fn matches_event_type(event_type: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1);
    }
    event_type == pattern
}

/// Read-only access to consumer configurations
#[async_trait]
pub trait ConsumerSource: Send + Sync {
    /// Load every consumer configuration
    async fn load(&self) -> Result<Vec<ConsumerConfig>>;
}

/// In-memory consumer source for tests and embedding
///
/// `replace` simulates client management editing its records; the core
/// itself never writes here.
#[derive(Default)]
pub struct MemoryConsumerSource {
    consumers: std::sync::RwLock<Vec<ConsumerConfig>>,
}

impl MemoryConsumerSource {
    pub fn new(consumers: Vec<ConsumerConfig>) -> Self {
        Self {
            consumers: std::sync::RwLock::new(consumers),
        }
    }

    /// Swap the whole configuration set
    pub fn replace(&self, consumers: Vec<ConsumerConfig>) -> Result<()> {
        let mut state = self.consumers.write().map_err(|e| {
            DispatchError::Storage(format!("Failed to acquire consumer lock: {}", e))
        })?;
        *state = consumers;
        Ok(())
    }
}

#[async_trait]
impl ConsumerSource for MemoryConsumerSource {
    async fn load(&self) -> Result<Vec<ConsumerConfig>> {
        let state = self.consumers.read().map_err(|e| {
            DispatchError::Storage(format!("Failed to acquire consumer lock: {}", e))
        })?;
        Ok(state.clone())
    }
}

/// JSON file consumer source
///
/// Reads a JSON array of consumer configurations. A missing file means
/// no consumers.
pub struct FileConsumerSource {
    path: PathBuf,
}

impl FileConsumerSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConsumerSource for FileConsumerSource {
    async fn load(&self) -> Result<Vec<ConsumerConfig>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DispatchError::Config(format!(
                "Failed to read consumer file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let consumers: Vec<ConsumerConfig> = serde_json::from_str(&json).map_err(|e| {
            DispatchError::Config(format!(
                "Failed to parse consumer file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            count = consumers.len(),
            "Consumers loaded"
        );
        Ok(consumers)
    }
}

/// Immutable view of consumer configuration at a point in time
#[derive(Debug, Clone)]
pub struct ConsumerSnapshot {
    /// Monotonic version, bumped on every refresh
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    consumers: Vec<ConsumerConfig>,
}

impl ConsumerSnapshot {
    pub fn new(version: u64, taken_at: DateTime<Utc>, consumers: Vec<ConsumerConfig>) -> Self {
        Self {
            version,
            taken_at,
            consumers,
        }
    }

    /// Snapshot with no consumers
    pub fn empty() -> Self {
        Self::new(0, Utc::now(), Vec::new())
    }

    pub fn consumers(&self) -> &[ConsumerConfig] {
        &self.consumers
    }

    /// Consumers belonging to `tenant`, enabled or not
    pub fn for_tenant<'a>(&'a self, tenant: &'a str) -> impl Iterator<Item = &'a ConsumerConfig> {
        self.consumers.iter().filter(move |c| c.tenant == tenant)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

/// Cheap, cloneable read handle on the latest snapshot
#[derive(Clone)]
pub struct SnapshotHandle {
    rx: watch::Receiver<Arc<ConsumerSnapshot>>,
}

impl SnapshotHandle {
    /// Handle pinned to a fixed snapshot (never refreshed)
    pub fn fixed(snapshot: ConsumerSnapshot) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(snapshot));
        Self { rx }
    }

    /// Latest snapshot; the borrow is released before returning
    pub fn current(&self) -> Arc<ConsumerSnapshot> {
        self.rx.borrow().clone()
    }
}

/// Reloads consumers from a source and publishes new snapshots
pub struct SnapshotRefresher {
    source: Arc<dyn ConsumerSource>,
    tx: watch::Sender<Arc<ConsumerSnapshot>>,
    clock: Arc<dyn Clock>,
}

impl SnapshotRefresher {
    /// Perform the initial load and return the refresher with its read handle
    pub async fn load(
        source: Arc<dyn ConsumerSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, SnapshotHandle)> {
        let consumers = source.load().await?;
        let snapshot = ConsumerSnapshot::new(1, clock.now(), consumers);
        let (tx, rx) = watch::channel(Arc::new(snapshot));
        Ok((Self { source, tx, clock }, SnapshotHandle { rx }))
    }

    /// Another read handle on the same snapshots
    pub fn handle(&self) -> SnapshotHandle {
        SnapshotHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Reload now; on failure the previous snapshot stays in place
    pub async fn refresh(&self) -> Result<Arc<ConsumerSnapshot>> {
        let consumers = self.source.load().await?;
        let version = self.tx.borrow().version + 1;
        let snapshot = Arc::new(ConsumerSnapshot::new(version, self.clock.now(), consumers));
        self.tx.send_replace(snapshot.clone());
        tracing::debug!(
            version,
            consumers = snapshot.len(),
            "Consumer snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// Refresh every `interval` until cancelled
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately; the initial load already happened
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "Consumer refresh failed, keeping previous snapshot");
                        }
                    }
                }
            }
            tracing::debug!("Consumer snapshot refresher stopped");
        })
    }
}
