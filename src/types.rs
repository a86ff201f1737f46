//! Core record types for the a3s-dispatch system
//!
//! Records use camelCase JSON serialization like the rest of the a3s
//! family. The outbound webhook envelope is the exception and keeps its
//! documented snake_case field names.

use crate::consumer::ConsumerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Processing state of an event
///
/// Moves forward only, apart from the retry loop delivering ↔ failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Recorded, not yet routed
    Pending,
    /// Claimed by a worker and matched against consumers
    Routed,
    /// At least one consumer delivery is in progress or awaiting retry
    Delivering,
    /// Every consumer acknowledged (or there was nothing to deliver)
    Delivered,
    /// At least one consumer failed permanently
    Failed,
    /// At least one consumer ran out of retries
    Exhausted,
}

impl EventStatus {
    /// Whether `self → next` is an allowed transition
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Pending, Routed)
                | (Routed, Delivering)
                | (Routed, Delivered)
                | (Routed, Failed)
                | (Delivering, Delivered)
                | (Delivering, Failed)
                | (Delivering, Exhausted)
                | (Failed, Delivering)
        )
    }

    /// True for states the core never leaves on its own
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventStatus::Delivered | EventStatus::Failed | EventStatus::Exhausted
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Routed => "routed",
            EventStatus::Delivering => "delivering",
            EventStatus::Delivered => "delivered",
            EventStatus::Failed => "failed",
            EventStatus::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// A discrete, immutable fact recorded for downstream consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Event type (e.g., "chat.message.created", "chat.feedback")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Tenant/client the event belongs to
    pub tenant: String,

    /// Optional client channel, used for channel-scoped routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Opaque structured payload
    pub payload: serde_json::Value,

    /// Optional key-value metadata (entity references, request ids, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Current processing state
    pub status: EventStatus,

    /// Store-assigned insertion order, used for FIFO listing
    #[serde(default)]
    pub sequence: u64,

    /// When a worker took the event for routing; the routing lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Create a pending event with auto-generated id
    pub fn new(
        event_type: impl Into<String>,
        tenant: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.into(),
            tenant: tenant.into(),
            channel: None,
            payload,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            status: EventStatus::Pending,
            sequence: 0,
            routed_at: None,
        }
    }

    /// Scope the event to a client channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the outbound webhook envelope for this event
    pub fn envelope(&self) -> Envelope {
        Envelope {
            event_id: self.id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            timestamp: self.created_at,
        }
    }
}

/// JSON body sent to webhook consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// One try at notifying a consumer of an event
///
/// Append-only; an event may have many attempts across consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub event_id: String,
    pub consumer_id: String,
    /// 1-based attempt number for this consumer
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// HTTP status for webhook consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Response excerpt or error description
    pub detail: String,
    pub duration_ms: u64,
}

/// State of one event/consumer delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created by routing, never attempted
    Pending,
    /// Claimed by a worker, attempt in flight
    Delivering,
    /// Consumer acknowledged
    Delivered,
    /// Last attempt failed; retried when `next_attempt_at` is set
    Failed,
    /// Retry budget spent
    Exhausted,
}

impl DeliveryStatus {
    /// Whether `self → next` is an allowed transition
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Delivering)
                | (Pending, Failed)
                | (Delivering, Delivered)
                | (Delivering, Failed)
                | (Delivering, Exhausted)
                | (Failed, Delivering)
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivering => "delivering",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Delivery of one event to one consumer
///
/// The consumer configuration is captured at routing time so later
/// configuration changes don't affect deliveries already in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub event_id: String,
    pub consumer: ConsumerConfig,
    pub status: DeliveryStatus,
    /// Attempts made so far
    pub attempts: u32,
    /// When the next retry becomes due (failed deliveries only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the current `delivering` claim was taken; the delivery lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Create a pending delivery
    pub fn new(event_id: impl Into<String>, consumer: ConsumerConfig, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.into(),
            consumer,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Consumer identifier
    pub fn consumer_id(&self) -> &str {
        &self.consumer.id
    }

    /// True once nothing further will happen to this delivery
    pub fn is_terminal(&self) -> bool {
        match self.status {
            DeliveryStatus::Delivered | DeliveryStatus::Exhausted => true,
            DeliveryStatus::Failed => self.next_attempt_at.is_none(),
            DeliveryStatus::Pending | DeliveryStatus::Delivering => false,
        }
    }

    /// True when a worker may claim this delivery at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Failed => self.next_attempt_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }
}

/// Changes applied by a conditional delivery update
#[derive(Debug, Clone)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Claim the update belongs to; when set, the update only applies if
    /// the delivery is still held under that claim
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Final event status derived from its deliveries
///
/// Returns `None` while any delivery is still in flight or awaiting retry.
pub fn settled_status(deliveries: &[Delivery]) -> Option<EventStatus> {
    if deliveries.iter().any(|d| !d.is_terminal()) {
        return None;
    }
    if deliveries
        .iter()
        .any(|d| d.status == DeliveryStatus::Exhausted)
    {
        Some(EventStatus::Exhausted)
    } else if deliveries.iter().any(|d| d.status == DeliveryStatus::Failed) {
        Some(EventStatus::Failed)
    } else {
        Some(EventStatus::Delivered)
    }
}

/// Event counts grouped by status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub statuses: HashMap<EventStatus, u64>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerConfig, DeliveryTarget};

    fn consumer() -> ConsumerConfig {
        ConsumerConfig::new(
            "c1",
            "t1",
            vec!["chat.*".to_string()],
            DeliveryTarget::webhook("https://example.com/hook"),
        )
    }

    #[test]
    fn test_event_creation() {
        let event = Event::new("chat.feedback", "t1", serde_json::json!({"score": 5}));
        assert!(event.id.starts_with("evt-"));
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.tenant, "t1");
        assert!(event.channel.is_none());
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn test_event_builders() {
        let event = Event::new("chat.message.created", "t1", serde_json::json!({}))
            .with_channel("web")
            .with_metadata("entityId", "msg-1");
        assert_eq!(event.channel.as_deref(), Some("web"));
        assert_eq!(event.metadata["entityId"], "msg-1");
    }

    #[test]
    fn test_event_serialization_uses_type_key() {
        let event = Event::new("chat.feedback", "t1", serde_json::json!({}));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"chat.feedback\""));
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"createdAt\""));
        assert!(!json.contains("channel"));
    }

    #[test]
    fn test_envelope_field_names() {
        let event = Event::new("chat.feedback", "t1", serde_json::json!({"score": 1}));
        let value = serde_json::to_value(event.envelope()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        assert_eq!(obj["event_id"], event.id.as_str());
        assert_eq!(obj["type"], "chat.feedback");
        assert_eq!(obj["payload"]["score"], 1);
        assert!(obj.contains_key("timestamp"));
    }

    #[test]
    fn test_event_status_transitions() {
        use EventStatus::*;
        assert!(Pending.can_transition_to(Routed));
        assert!(Routed.can_transition_to(Delivered));
        assert!(Delivering.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Delivering));
        assert!(!Routed.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Delivering));
        assert!(!Exhausted.can_transition_to(Delivering));
        assert!(!Pending.can_transition_to(Delivered));
    }

    #[test]
    fn test_delivery_terminal_and_due() {
        let now = Utc::now();
        let mut d = Delivery::new("evt-1", consumer(), now);
        assert!(d.is_due(now));
        assert!(!d.is_terminal());

        d.status = DeliveryStatus::Failed;
        d.next_attempt_at = Some(now + chrono::Duration::seconds(10));
        assert!(!d.is_terminal());
        assert!(!d.is_due(now));
        assert!(d.is_due(now + chrono::Duration::seconds(10)));

        d.next_attempt_at = None;
        assert!(d.is_terminal());
        assert!(!d.is_due(now));
    }

    #[test]
    fn test_settled_status() {
        let now = Utc::now();
        let mut a = Delivery::new("evt-1", consumer(), now);
        let mut b = Delivery::new("evt-1", consumer(), now);

        assert_eq!(settled_status(&[a.clone(), b.clone()]), None);

        a.status = DeliveryStatus::Delivered;
        b.status = DeliveryStatus::Delivered;
        assert_eq!(
            settled_status(&[a.clone(), b.clone()]),
            Some(EventStatus::Delivered)
        );

        b.status = DeliveryStatus::Failed;
        assert_eq!(
            settled_status(&[a.clone(), b.clone()]),
            Some(EventStatus::Failed)
        );

        a.status = DeliveryStatus::Exhausted;
        assert_eq!(settled_status(&[a, b]), Some(EventStatus::Exhausted));

        assert_eq!(settled_status(&[]), Some(EventStatus::Delivered));
    }
}
