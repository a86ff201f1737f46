//! Dead-letter surface for deliveries that ran out of retries
//!
//! Exhausted deliveries stay in the event store; the `DlqHandler` is an
//! additional hand-off so operators see them without scanning the store.

use crate::error::Result;
use crate::types::{Delivery, Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An exhausted delivery with the context needed to inspect or replay it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The event that could not be delivered
    pub event: Event,

    /// The delivery record as it was when the budget ran out
    pub delivery: Delivery,

    /// Last failure seen for this consumer
    pub reason: String,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        event: Event,
        delivery: Delivery,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            delivery,
            reason: reason.into(),
            dead_lettered_at: at,
        }
    }

    /// Consumer the delivery was meant for
    pub fn consumer_id(&self) -> &str {
        self.delivery.consumer_id()
    }
}

/// Receives deliveries that exhausted their retry budget
///
/// Implementations may log, store, forward, or alert. A failing handler
/// does not undo the `exhausted` status already written to the store.
#[async_trait]
pub trait DlqHandler: Send + Sync {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()>;

    /// Number of dead letters currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory DLQ with a capacity bound; the oldest entries are dropped first
pub struct MemoryDlqHandler {
    entries: Arc<RwLock<VecDeque<DeadLetter>>>,
    capacity: usize,
}

impl MemoryDlqHandler {
    /// `capacity = 0` means unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            event_id = %dead_letter.event.id,
            event_type = %dead_letter.event.event_type,
            consumer_id = %dead_letter.consumer_id(),
            attempts = dead_letter.delivery.attempts,
            reason = %dead_letter.reason,
            "Delivery dead-lettered"
        );

        let mut entries = self.entries.write().await;
        entries.push_back(dead_letter);
        while self.capacity > 0 && entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerConfig, DeliveryTarget};
    use crate::types::DeliveryStatus;

    fn dead_letter(reason: &str) -> DeadLetter {
        let event = Event::new("chat.feedback", "t1", serde_json::json!({}));
        let consumer = ConsumerConfig::new(
            "c1",
            "t1",
            vec!["chat.feedback".into()],
            DeliveryTarget::webhook("https://example.com/hook"),
        );
        let mut delivery = Delivery::new(&event.id, consumer, Utc::now());
        delivery.status = DeliveryStatus::Exhausted;
        delivery.attempts = 3;
        DeadLetter::new(event, delivery, reason, Utc::now())
    }

    #[tokio::test]
    async fn test_memory_dlq_handle_and_count() {
        let dlq = MemoryDlqHandler::default();
        assert_eq!(dlq.count().await.unwrap(), 0);

        dlq.handle(dead_letter("HTTP 503")).await.unwrap();
        assert_eq!(dlq.count().await.unwrap(), 1);

        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].consumer_id(), "c1");
        assert_eq!(list[0].delivery.attempts, 3);
    }

    #[tokio::test]
    async fn test_memory_dlq_list_newest_first() {
        let dlq = MemoryDlqHandler::default();
        for i in 0..5 {
            dlq.handle(dead_letter(&format!("reason {}", i))).await.unwrap();
        }

        let list = dlq.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }

    #[tokio::test]
    async fn test_memory_dlq_capacity() {
        let dlq = MemoryDlqHandler::new(3);
        for i in 0..5 {
            dlq.handle(dead_letter(&format!("reason {}", i))).await.unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }

    #[test]
    fn test_dead_letter_serializes_camel_case() {
        let json = serde_json::to_value(dead_letter("x")).unwrap();
        assert!(json.get("deadLetteredAt").is_some());
        assert_eq!(json["delivery"]["status"], "exhausted");
    }
}
