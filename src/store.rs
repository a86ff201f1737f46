//! Event store: durable record of events, deliveries, and attempts
//!
//! All mutation goes through conditional updates keyed on the expected
//! prior status, so concurrent workers never double-process a record.
//! Claims on events (`routed`) and deliveries (`delivering`) carry a
//! timestamp; a claim older than the lease is taken back by the recovery
//! sweep, so a worker that dies or errors mid-step never strands a record.
//! The core never deletes anything here; retention is someone else's job.

use crate::error::{DispatchError, Result};
use crate::types::{
    Delivery, DeliveryAttempt, DeliveryStatus, DeliveryUpdate, Event, EventStatus, StatusCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Storage contract for events and their delivery state
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event as `pending`, returning its id
    ///
    /// The store assigns the FIFO sequence number.
    async fn record(&self, event: Event) -> Result<String>;

    /// Fetch an event by id
    async fn get(&self, event_id: &str) -> Result<Option<Event>>;

    /// Compare-and-set the event status
    ///
    /// Fails with `ConcurrencyConflict` if the current status is not
    /// `expected_prior`, and with `InvalidTransition` if the move is not
    /// allowed.
    async fn update_status(
        &self,
        event_id: &str,
        status: EventStatus,
        expected_prior: EventStatus,
    ) -> Result<()>;

    /// Atomically move a pending event to `routed`, stamping the routing lease
    ///
    /// Fails with `ConcurrencyConflict` if the event is no longer pending.
    async fn claim_for_routing(&self, event_id: &str, now: DateTime<Utc>) -> Result<Event>;

    /// Events stuck in `routed` since before `routed_before`, oldest first
    async fn list_stale_routed(
        &self,
        routed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Take over an expired routing lease
    ///
    /// Succeeds only while the event is still `routed` under a lease taken
    /// before `routed_before`; the lease is renewed to `now`.
    async fn renew_routing(
        &self,
        event_id: &str,
        routed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Event>;

    /// Append an attempt to the audit trail
    ///
    /// The attempt number must be exactly one past the delivery's attempt
    /// count and may not exceed the consumer's retry limit.
    async fn append_attempt(&self, attempt: DeliveryAttempt) -> Result<()>;

    /// Pending events with sequence greater than `after`, oldest first
    async fn list_pending_after(&self, after: Option<u64>, limit: usize) -> Result<Vec<Event>>;

    /// Up to `limit` pending events in creation order
    async fn list_pending(&self, limit: usize) -> Result<Vec<Event>> {
        self.list_pending_after(None, limit).await
    }

    /// All attempts for an event, in append order
    async fn list_attempts(&self, event_id: &str) -> Result<Vec<DeliveryAttempt>>;

    /// Most recent events with the given status, newest first
    async fn list_by_status(&self, status: EventStatus, limit: usize) -> Result<Vec<Event>>;

    /// Event counts grouped by status
    async fn count_by_status(&self) -> Result<StatusCounts>;

    /// Create the delivery record for an event/consumer pair
    async fn insert_delivery(&self, delivery: Delivery) -> Result<()>;

    /// Atomically move a due delivery to `delivering`
    ///
    /// Succeeds only for `pending` deliveries or `failed` ones whose retry
    /// time has come; anything else is a conflict.
    async fn claim_delivery(
        &self,
        event_id: &str,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Delivery>;

    /// Compare-and-set a delivery's status and retry bookkeeping
    ///
    /// With `update.claimed_at` set, also fails with `ConcurrencyConflict`
    /// when the delivery has since been claimed again.
    async fn update_delivery(
        &self,
        event_id: &str,
        consumer_id: &str,
        update: DeliveryUpdate,
        expected_prior: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<Delivery>;

    /// Deliveries that are pending or whose retry is due, oldest due first
    async fn list_due_deliveries(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<Delivery>>;

    /// All deliveries of an event, ordered by consumer id
    async fn list_deliveries(&self, event_id: &str) -> Result<Vec<Delivery>>;

    /// Make `delivering` deliveries claimed before `claimed_before` due again
    ///
    /// They become `failed` with a retry due at `now`; the attempt count is
    /// kept, so the retry budget still applies. Returns what was requeued.
    async fn requeue_stale_deliveries(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>>;

    /// Ids of `delivering` events whose deliveries are all terminal, oldest first
    async fn list_unsettled(&self, limit: usize) -> Result<Vec<String>>;
}

/// Lazily page through pending events
///
/// Restartable: each call starts from the oldest pending event. Pages are
/// fetched with `page_size` per store call only as the stream is polled.
pub fn pending_stream(
    store: Arc<dyn EventStore>,
    page_size: usize,
) -> BoxStream<'static, Result<Event>> {
    let page_size = page_size.max(1);
    stream::unfold(
        (store, None::<u64>, false),
        move |(store, cursor, done)| async move {
            if done {
                return None;
            }
            match store.list_pending_after(cursor, page_size).await {
                Ok(page) => {
                    let exhausted = page.len() < page_size;
                    let next = page.last().map(|e| e.sequence).or(cursor);
                    if page.is_empty() {
                        return None;
                    }
                    let items: Vec<Result<Event>> = page.into_iter().map(Ok).collect();
                    Some((stream::iter(items), (store, next, exhausted)))
                }
                Err(e) => Some((stream::iter(vec![Err(e)]), (store, cursor, true))),
            }
        },
    )
    .flatten()
    .boxed()
}

type DeliveryKey = (String, String);

#[derive(Default)]
struct MemoryState {
    next_sequence: u64,
    /// sequence → event id, keeps FIFO order cheap
    order: BTreeMap<u64, String>,
    events: HashMap<String, Event>,
    attempts: HashMap<String, Vec<DeliveryAttempt>>,
    deliveries: HashMap<DeliveryKey, Delivery>,
}

/// In-memory event store for development, tests, and single-process use
///
/// Each conditional update runs under one write lock, which makes it an
/// atomic compare-and-set. The lock is never held across an `.await`.
///
/// ```
/// use a3s_dispatch::{Event, EventStatus, EventStore, MemoryEventStore};
///
/// # tokio_test::block_on(async {
/// let store = MemoryEventStore::new();
/// let id = store
///     .record(Event::new("chat.feedback", "t1", serde_json::json!({"score": 5})))
///     .await?;
/// assert_eq!(store.get(&id).await?.map(|e| e.status), Some(EventStatus::Pending));
/// # Ok::<(), a3s_dispatch::DispatchError>(())
/// # }).unwrap();
/// ```
#[derive(Default)]
pub struct MemoryEventStore {
    state: RwLock<MemoryState>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| DispatchError::Storage(format!("Event store lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| DispatchError::Storage(format!("Event store lock poisoned: {}", e)))
    }
}

fn delivery_key(event_id: &str, consumer_id: &str) -> DeliveryKey {
    (event_id.to_string(), consumer_id.to_string())
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn record(&self, mut event: Event) -> Result<String> {
        let mut state = self.write()?;
        if state.events.contains_key(&event.id) {
            return Err(DispatchError::Storage(format!(
                "Event {} already recorded",
                event.id
            )));
        }

        state.next_sequence += 1;
        event.sequence = state.next_sequence;
        event.status = EventStatus::Pending;

        let id = event.id.clone();
        state.order.insert(event.sequence, id.clone());
        state.events.insert(id.clone(), event);
        Ok(id)
    }

    async fn get(&self, event_id: &str) -> Result<Option<Event>> {
        Ok(self.read()?.events.get(event_id).cloned())
    }

    async fn update_status(
        &self,
        event_id: &str,
        status: EventStatus,
        expected_prior: EventStatus,
    ) -> Result<()> {
        let mut state = self.write()?;
        let event = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| DispatchError::NotFound(format!("Event {}", event_id)))?;

        if event.status != expected_prior {
            return Err(DispatchError::conflict(
                "event",
                event_id,
                expected_prior,
                event.status,
            ));
        }
        if !expected_prior.can_transition_to(status) {
            return Err(DispatchError::InvalidTransition {
                entity: "event",
                id: event_id.to_string(),
                from: expected_prior.to_string(),
                to: status.to_string(),
            });
        }

        event.status = status;
        Ok(())
    }

    async fn claim_for_routing(&self, event_id: &str, now: DateTime<Utc>) -> Result<Event> {
        let mut state = self.write()?;
        let event = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| DispatchError::NotFound(format!("Event {}", event_id)))?;

        if event.status != EventStatus::Pending {
            return Err(DispatchError::conflict(
                "event",
                event_id,
                EventStatus::Pending,
                event.status,
            ));
        }
        event.status = EventStatus::Routed;
        event.routed_at = Some(now);
        Ok(event.clone())
    }

    async fn list_stale_routed(
        &self,
        routed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let state = self.read()?;
        Ok(state
            .order
            .values()
            .filter_map(|id| state.events.get(id))
            .filter(|e| routing_expired(e, routed_before))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn renew_routing(
        &self,
        event_id: &str,
        routed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Event> {
        let mut state = self.write()?;
        let event = state
            .events
            .get_mut(event_id)
            .ok_or_else(|| DispatchError::NotFound(format!("Event {}", event_id)))?;

        if !routing_expired(event, routed_before) {
            return Err(DispatchError::conflict(
                "event",
                event_id,
                "expired routing lease",
                event.status,
            ));
        }
        event.routed_at = Some(now);
        Ok(event.clone())
    }

    async fn append_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        let mut state = self.write()?;
        let key = delivery_key(&attempt.event_id, &attempt.consumer_id);
        let delivery = state.deliveries.get_mut(&key).ok_or_else(|| {
            DispatchError::NotFound(format!(
                "Delivery {} → {}",
                attempt.event_id, attempt.consumer_id
            ))
        })?;

        let expected = delivery.attempts + 1;
        if attempt.attempt_number != expected {
            return Err(DispatchError::conflict(
                "attempt",
                format!("{}/{}", attempt.event_id, attempt.consumer_id),
                expected,
                attempt.attempt_number,
            ));
        }
        let max_attempts = delivery.consumer.retry_policy().max_attempts;
        if attempt.attempt_number > max_attempts {
            return Err(DispatchError::Storage(format!(
                "Attempt {} exceeds retry limit {} for consumer {}",
                attempt.attempt_number, max_attempts, attempt.consumer_id
            )));
        }

        delivery.attempts = attempt.attempt_number;
        delivery.updated_at = attempt.timestamp;
        state
            .attempts
            .entry(attempt.event_id.clone())
            .or_default()
            .push(attempt);
        Ok(())
    }

    async fn list_pending_after(&self, after: Option<u64>, limit: usize) -> Result<Vec<Event>> {
        let state = self.read()?;
        let start = after.map(|s| s + 1).unwrap_or(0);
        Ok(state
            .order
            .range(start..)
            .filter_map(|(_, id)| state.events.get(id))
            .filter(|e| e.status == EventStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_attempts(&self, event_id: &str) -> Result<Vec<DeliveryAttempt>> {
        Ok(self
            .read()?
            .attempts
            .get(event_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_by_status(&self, status: EventStatus, limit: usize) -> Result<Vec<Event>> {
        let state = self.read()?;
        Ok(state
            .order
            .values()
            .rev()
            .filter_map(|id| state.events.get(id))
            .filter(|e| e.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let state = self.read()?;
        let mut counts = StatusCounts::default();
        for event in state.events.values() {
            *counts.statuses.entry(event.status).or_insert(0) += 1;
            counts.total += 1;
        }
        Ok(counts)
    }

    async fn insert_delivery(&self, delivery: Delivery) -> Result<()> {
        let mut state = self.write()?;
        if !state.events.contains_key(&delivery.event_id) {
            return Err(DispatchError::NotFound(format!(
                "Event {}",
                delivery.event_id
            )));
        }
        let key = delivery_key(&delivery.event_id, delivery.consumer_id());
        if state.deliveries.contains_key(&key) {
            return Err(DispatchError::conflict(
                "delivery",
                format!("{}/{}", key.0, key.1),
                "absent",
                "present",
            ));
        }
        state.deliveries.insert(key, delivery);
        Ok(())
    }

    async fn claim_delivery(
        &self,
        event_id: &str,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Delivery> {
        let mut state = self.write()?;
        let delivery = state
            .deliveries
            .get_mut(&delivery_key(event_id, consumer_id))
            .ok_or_else(|| {
                DispatchError::NotFound(format!("Delivery {} → {}", event_id, consumer_id))
            })?;

        if !delivery.is_due(now) {
            return Err(DispatchError::conflict(
                "delivery",
                format!("{}/{}", event_id, consumer_id),
                "due",
                delivery.status,
            ));
        }

        delivery.status = DeliveryStatus::Delivering;
        delivery.next_attempt_at = None;
        delivery.claimed_at = Some(now);
        delivery.updated_at = now;
        Ok(delivery.clone())
    }

    async fn update_delivery(
        &self,
        event_id: &str,
        consumer_id: &str,
        update: DeliveryUpdate,
        expected_prior: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<Delivery> {
        let mut state = self.write()?;
        let id = format!("{}/{}", event_id, consumer_id);
        let delivery = state
            .deliveries
            .get_mut(&delivery_key(event_id, consumer_id))
            .ok_or_else(|| DispatchError::NotFound(format!("Delivery {}", id)))?;

        if delivery.status != expected_prior {
            return Err(DispatchError::conflict(
                "delivery",
                id,
                expected_prior,
                delivery.status,
            ));
        }
        if update.claimed_at.is_some() && update.claimed_at != delivery.claimed_at {
            return Err(DispatchError::conflict(
                "delivery",
                id,
                "claim held by caller",
                "claim taken over",
            ));
        }
        if !expected_prior.can_transition_to(update.status) {
            return Err(DispatchError::InvalidTransition {
                entity: "delivery",
                id,
                from: expected_prior.to_string(),
                to: update.status.to_string(),
            });
        }

        delivery.status = update.status;
        delivery.next_attempt_at = update.next_attempt_at;
        delivery.last_error = update.last_error;
        delivery.claimed_at = None;
        delivery.updated_at = now;
        Ok(delivery.clone())
    }

    async fn list_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Delivery>> {
        let state = self.read()?;
        let mut due: Vec<&Delivery> = state
            .deliveries
            .values()
            .filter(|d| d.is_due(now))
            .collect();
        due.sort_by(|a, b| {
            let a_at = a.next_attempt_at.unwrap_or(a.created_at);
            let b_at = b.next_attempt_at.unwrap_or(b.created_at);
            a_at.cmp(&b_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
                .then_with(|| a.consumer_id().cmp(b.consumer_id()))
        });
        Ok(due.into_iter().take(limit).cloned().collect())
    }

    async fn list_deliveries(&self, event_id: &str) -> Result<Vec<Delivery>> {
        let state = self.read()?;
        let mut deliveries: Vec<Delivery> = state
            .deliveries
            .values()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.consumer_id().cmp(b.consumer_id()));
        Ok(deliveries)
    }

    async fn requeue_stale_deliveries(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>> {
        let mut state = self.write()?;
        let mut requeued = Vec::new();
        for delivery in state.deliveries.values_mut() {
            let stale = delivery.status == DeliveryStatus::Delivering
                && delivery.claimed_at.is_some_and(|at| at < claimed_before);
            if !stale {
                continue;
            }
            delivery.status = DeliveryStatus::Failed;
            delivery.next_attempt_at = Some(now);
            delivery.last_error = Some(match delivery.last_error.take() {
                Some(previous) => format!("delivery lease expired (last error: {})", previous),
                None => "delivery lease expired".to_string(),
            });
            delivery.claimed_at = None;
            delivery.updated_at = now;
            requeued.push(delivery.clone());
        }
        requeued.sort_by(|a, b| {
            a.event_id
                .cmp(&b.event_id)
                .then_with(|| a.consumer_id().cmp(b.consumer_id()))
        });
        Ok(requeued)
    }

    async fn list_unsettled(&self, limit: usize) -> Result<Vec<String>> {
        let state = self.read()?;
        let mut by_event: HashMap<&str, Vec<&Delivery>> = HashMap::new();
        for delivery in state.deliveries.values() {
            by_event
                .entry(delivery.event_id.as_str())
                .or_default()
                .push(delivery);
        }

        Ok(state
            .order
            .values()
            .filter_map(|id| state.events.get(id))
            .filter(|e| e.status == EventStatus::Delivering)
            .filter(|e| {
                by_event
                    .get(e.id.as_str())
                    .is_some_and(|ds| ds.iter().all(|d| d.is_terminal()))
            })
            .take(limit)
            .map(|e| e.id.clone())
            .collect())
    }
}

fn routing_expired(event: &Event, routed_before: DateTime<Utc>) -> bool {
    event.status == EventStatus::Routed && event.routed_at.is_some_and(|at| at < routed_before)
}
