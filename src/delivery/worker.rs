//! Delivery worker pool
//!
//! Workers repeatedly make one pass over the store: route pending events,
//! then attempt every delivery that is due. Several workers may run the
//! same pass concurrently; the store's conditional updates make sure each
//! event is routed once and each attempt is made by a single worker.
//!
//! One worker also runs the recovery sweep. Routing and delivery claims
//! are leases: when a worker errors out or dies between claiming and
//! recording the result, the sweep makes the record workable again once
//! the lease has expired.

use super::webhook::{send_attempt, WebhookRequest, WebhookTransport};
use super::DeliveryOutcome;
use crate::config::DeliveryConfig;
use crate::consumer::{ConsumerConfig, DeliveryTarget, SnapshotHandle};
use crate::dlq::{DeadLetter, DlqHandler};
use crate::error::{DispatchError, Result};
use crate::retry::RetryPolicy;
use crate::router::EventRouter;
use crate::store::{pending_stream, EventStore};
use crate::task::{TaskRequest, TaskScheduler};
use crate::time::{add_duration, sub_duration, Clock};
use crate::types::{
    settled_status, Delivery, DeliveryAttempt, DeliveryStatus, DeliveryUpdate, Event, EventStatus,
};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What routing did with one event
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSummary {
    pub event_id: String,
    /// Consumers that got a pending delivery
    pub routed: usize,
    /// Consumers failed at routing because of bad configuration
    pub rejected: usize,
    /// Event status after routing
    pub status: EventStatus,
}

/// Work done by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub routed: usize,
    pub attempted: usize,
    /// Items another worker got to first
    pub conflicts: usize,
    pub errors: usize,
}

impl PassStats {
    pub fn is_idle(&self) -> bool {
        self.routed == 0 && self.attempted == 0
    }
}

/// What a recovery sweep took back from expired leases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Deliveries left `delivering` past the lease, made due again
    pub requeued: usize,
    /// Events left `routed` past the lease, routed again
    pub rerouted: usize,
    /// Events whose last delivery finished without the event settling
    pub settled: usize,
}

#[derive(Clone)]
struct PoolInner {
    store: Arc<dyn EventStore>,
    snapshots: SnapshotHandle,
    router: EventRouter,
    transport: Arc<dyn WebhookTransport>,
    tasks: TaskScheduler,
    dlq: Arc<dyn DlqHandler>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
    /// Applied to consumers without their own policy
    default_retry: RetryPolicy,
}

/// Routes pending events and delivers them to consumers
pub struct DeliveryWorkerPool {
    inner: Arc<PoolInner>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryWorkerPool {
    pub fn new(
        store: Arc<dyn EventStore>,
        snapshots: SnapshotHandle,
        transport: Arc<dyn WebhookTransport>,
        tasks: TaskScheduler,
        dlq: Arc<dyn DlqHandler>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                snapshots,
                router: EventRouter::new(),
                transport,
                tasks,
                dlq,
                clock,
                config,
                default_retry: RetryPolicy::default(),
            }),
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Retry policy for consumers that don't carry their own
    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        Arc::make_mut(&mut self.inner).default_retry = retry;
        self
    }

    /// Wake one idle worker, e.g. after an event was recorded
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Claim a pending event and create its deliveries
    ///
    /// Fails with `ConcurrencyConflict` if another worker claimed it first.
    pub async fn route_event(&self, event: &Event) -> Result<RouteSummary> {
        self.inner.route_event(event).await
    }

    /// Make one delivery attempt without touching the store
    pub async fn deliver(
        &self,
        event: &Event,
        consumer: &ConsumerConfig,
        attempt: u32,
    ) -> DeliveryOutcome {
        self.inner.deliver(event, consumer, attempt).await.0
    }

    /// Claim a due delivery, attempt it, and record the result
    ///
    /// Returns the delivery's new status, or `None` if another worker
    /// claimed it first.
    pub async fn process_delivery(&self, delivery: &Delivery) -> Result<Option<DeliveryStatus>> {
        self.inner.process_delivery(delivery).await
    }

    /// One routing and delivery pass on the calling task
    pub async fn run_once(&self) -> Result<PassStats> {
        self.inner.run_once().await
    }

    /// Reclaim events and deliveries whose lease expired
    pub async fn sweep(&self) -> Result<SweepStats> {
        self.inner.sweep().await
    }

    /// Start the configured number of background workers
    pub fn spawn(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        tracing::info!(
            worker_count = self.inner.config.worker_count,
            "Spawning delivery workers"
        );

        for n in 0..self.inner.config.worker_count {
            let inner = self.inner.clone();
            let wake = self.wake.clone();
            let cancel = self.cancel.clone();
            // one worker per pool sweeps expired leases
            let sweeps = n == 0;
            handles.push(tokio::spawn(async move {
                worker_loop(inner, n, sweeps, wake, cancel).await;
            }));
        }
    }

    /// Stop workers, letting in-flight attempts finish within `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if handles.is_empty() {
            return Ok(());
        }

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for (worker, result) in results.into_iter().enumerate() {
                    if let Err(e) = result {
                        tracing::error!(worker, error = %e, "Delivery worker panicked");
                    }
                }
                tracing::info!("Delivery workers stopped");
                Ok(())
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Delivery worker shutdown timed out"
                );
                Err(DispatchError::Shutdown(format!(
                    "delivery workers still running after {:?}",
                    timeout
                )))
            }
        }
    }
}

async fn worker_loop(
    inner: Arc<PoolInner>,
    worker: usize,
    sweeps: bool,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker, "Delivery worker started");
    let poll = inner.config.poll_interval();
    let mut last_sweep: Option<tokio::time::Instant> = None;

    while !cancel.is_cancelled() {
        if sweeps && last_sweep.map_or(true, |at| at.elapsed() >= poll) {
            if let Err(e) = inner.sweep().await {
                tracing::error!(worker, error = %e, "Lease recovery sweep failed");
            }
            last_sweep = Some(tokio::time::Instant::now());
        }

        let idle = match inner.run_once().await {
            Ok(stats) => stats.is_idle(),
            Err(e) => {
                tracing::error!(worker, error = %e, "Delivery pass failed");
                true
            }
        };
        if !idle {
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
    tracing::debug!(worker, "Delivery worker stopped");
}

impl PoolInner {
    async fn run_once(&self) -> Result<PassStats> {
        let mut stats = PassStats::default();
        let batch = self.config.batch_size.max(1);

        let mut pending = pending_stream(self.store.clone(), batch).take(batch);
        while let Some(event) = pending.next().await {
            let event = event?;
            match self.route_event(&event).await {
                Ok(_) => stats.routed += 1,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(event_id = %event.id, "Event already claimed by another worker");
                    stats.conflicts += 1;
                }
                Err(e) => {
                    tracing::error!(event_id = %event.id, error = %e, "Routing failed");
                    stats.errors += 1;
                }
            }
        }

        let due = self
            .store
            .list_due_deliveries(self.clock.now(), batch)
            .await?;
        for delivery in &due {
            match self.process_delivery(delivery).await {
                Ok(Some(_)) => stats.attempted += 1,
                Ok(None) => stats.conflicts += 1,
                Err(e) => {
                    tracing::error!(
                        event_id = %delivery.event_id,
                        consumer_id = %delivery.consumer_id(),
                        error = %e,
                        "Delivery processing failed"
                    );
                    stats.errors += 1;
                }
            }
        }

        if !stats.is_idle() {
            tracing::debug!(
                routed = stats.routed,
                attempted = stats.attempted,
                conflicts = stats.conflicts,
                errors = stats.errors,
                "Delivery pass finished"
            );
        }
        Ok(stats)
    }

    async fn sweep(&self) -> Result<SweepStats> {
        let now = self.clock.now();
        let cutoff = sub_duration(now, self.config.lease_timeout());
        let batch = self.config.batch_size.max(1);
        let mut stats = SweepStats::default();

        for delivery in self.store.requeue_stale_deliveries(cutoff, now).await? {
            tracing::warn!(
                event_id = %delivery.event_id,
                consumer_id = %delivery.consumer_id(),
                attempts = delivery.attempts,
                "Delivery lease expired, requeued"
            );
            stats.requeued += 1;
        }

        for stale in self.store.list_stale_routed(cutoff, batch).await? {
            let event = match self.store.renew_routing(&stale.id, cutoff, now).await {
                Ok(event) => event,
                Err(e) if e.is_conflict() => continue,
                Err(e) => {
                    tracing::error!(event_id = %stale.id, error = %e, "Routing lease renewal failed");
                    continue;
                }
            };
            tracing::warn!(event_id = %event.id, "Routing lease expired, routing again");
            match self.fan_out(&event).await {
                Ok(_) => stats.rerouted += 1,
                Err(e) if e.is_conflict() => {}
                Err(e) => {
                    tracing::error!(event_id = %event.id, error = %e, "Routing failed");
                }
            }
        }

        for event_id in self.store.list_unsettled(batch).await? {
            match self.settle_event(&event_id).await {
                Ok(Some(_)) => stats.settled += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(event_id = %event_id, error = %e, "Settling event failed");
                }
            }
        }

        if stats != SweepStats::default() {
            tracing::info!(
                requeued = stats.requeued,
                rerouted = stats.rerouted,
                settled = stats.settled,
                "Recovered work from expired leases"
            );
        }
        Ok(stats)
    }

    async fn route_event(&self, event: &Event) -> Result<RouteSummary> {
        let event = self
            .store
            .claim_for_routing(&event.id, self.clock.now())
            .await?;
        self.fan_out(&event).await
    }

    /// Create the event's deliveries and move it on from `routed`
    ///
    /// Safe to run again on an event whose earlier run stopped halfway:
    /// deliveries that already exist are left as they are.
    async fn fan_out(&self, event: &Event) -> Result<RouteSummary> {
        let snapshot = self.snapshots.current();
        let plan = self.router.route(event, &snapshot);
        let now = self.clock.now();

        let mut summary = RouteSummary {
            event_id: event.id.clone(),
            routed: plan.routes.len(),
            rejected: plan.rejected.len(),
            status: EventStatus::Delivered,
        };

        if plan.is_empty() {
            self.store
                .update_status(&event.id, EventStatus::Delivered, EventStatus::Routed)
                .await?;
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                tenant = %event.tenant,
                "No consumers matched, nothing to deliver"
            );
            return Ok(summary);
        }

        // deliveries are created while the event is still `routed`, so no
        // worker can settle it before every delivery exists
        for (consumer, error) in &plan.rejected {
            let mut delivery = Delivery::new(&event.id, self.resolve(consumer), now);
            delivery.status = DeliveryStatus::Failed;
            delivery.last_error = Some(error.to_string());
            self.insert_delivery_once(delivery).await?;
        }
        for consumer in &plan.routes {
            self.insert_delivery_once(Delivery::new(&event.id, self.resolve(consumer), now))
                .await?;
        }

        if plan.routes.is_empty() {
            self.store
                .update_status(&event.id, EventStatus::Failed, EventStatus::Routed)
                .await?;
            tracing::warn!(
                event_id = %event.id,
                rejected = summary.rejected,
                "Every matched consumer is misconfigured"
            );
            summary.status = EventStatus::Failed;
            return Ok(summary);
        }

        self.store
            .update_status(&event.id, EventStatus::Delivering, EventStatus::Routed)
            .await?;
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            consumers = summary.routed,
            rejected = summary.rejected,
            "Event routed"
        );

        // deliveries may have finished while the event was still `routed`
        summary.status = self
            .settle_event(&event.id)
            .await?
            .unwrap_or(EventStatus::Delivering);
        Ok(summary)
    }

    async fn insert_delivery_once(&self, delivery: Delivery) -> Result<()> {
        match self.store.insert_delivery(delivery).await {
            Err(e) if e.is_conflict() => Ok(()),
            result => result,
        }
    }

    /// Snapshot the consumer into a delivery with its retry policy pinned
    fn resolve(&self, consumer: &ConsumerConfig) -> ConsumerConfig {
        let mut consumer = consumer.clone();
        consumer
            .retry
            .get_or_insert_with(|| self.default_retry.clone());
        consumer
    }

    async fn deliver(
        &self,
        event: &Event,
        consumer: &ConsumerConfig,
        attempt: u32,
    ) -> (DeliveryOutcome, Duration) {
        match &consumer.target {
            DeliveryTarget::Webhook { .. } => {
                match WebhookRequest::build(event, consumer, attempt, self.config.request_timeout())
                {
                    Ok(request) => send_attempt(self.transport.as_ref(), request).await,
                    Err(e) => (
                        DeliveryOutcome::Permanent {
                            status_code: None,
                            detail: e.to_string(),
                        },
                        Duration::ZERO,
                    ),
                }
            }
            DeliveryTarget::Task { kind } => {
                let started = std::time::Instant::now();
                let request = TaskRequest::new(
                    kind.clone(),
                    serde_json::json!({
                        "consumerId": consumer.id,
                        "tenant": event.tenant,
                        "envelope": event.envelope(),
                    }),
                )
                .with_dedup_key(format!("delivery:{}:{}", event.id, consumer.id));

                let outcome = match self.tasks.enqueue(request).await {
                    Ok(task_id) => DeliveryOutcome::Delivered {
                        status_code: None,
                        detail: format!("enqueued {}", task_id),
                    },
                    Err(e) => DeliveryOutcome::Transient {
                        status_code: None,
                        detail: format!("enqueue failed: {}", e),
                        timed_out: false,
                    },
                };
                (outcome, started.elapsed())
            }
        }
    }

    async fn process_delivery(&self, delivery: &Delivery) -> Result<Option<DeliveryStatus>> {
        let event_id = delivery.event_id.as_str();
        let consumer_id = delivery.consumer_id();

        let claimed = match self
            .store
            .claim_delivery(event_id, consumer_id, self.clock.now())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) if e.is_conflict() => {
                tracing::debug!(event_id, consumer_id, "Delivery already claimed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.attempt_claimed(&claimed).await {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_conflict() => {
                // lease expired mid-attempt and another worker holds it now
                tracing::warn!(
                    event_id,
                    consumer_id,
                    error = %e,
                    "Delivery claim lost, result discarded"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Attempt a delivery this worker holds the claim on
    async fn attempt_claimed(&self, claimed: &Delivery) -> Result<DeliveryStatus> {
        let event_id = claimed.event_id.as_str();
        let consumer_id = claimed.consumer_id();

        let event = self
            .store
            .get(event_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Event {}", event_id)))?;
        let policy = claimed.consumer.retry_policy();

        // nothing left in the budget; close out without another attempt
        if claimed.attempts >= policy.max_attempts {
            let reason = claimed
                .last_error
                .clone()
                .unwrap_or_else(|| "retry budget exhausted".to_string());
            self.finish(&event, claimed, DeliveryStatus::Exhausted, None, reason)
                .await?;
            return Ok(DeliveryStatus::Exhausted);
        }

        let attempt_number = claimed.attempts + 1;
        let (outcome, elapsed) = self.deliver(&event, &claimed.consumer, attempt_number).await;
        let finished_at = self.clock.now();

        self.store
            .append_attempt(DeliveryAttempt {
                event_id: event_id.to_string(),
                consumer_id: consumer_id.to_string(),
                attempt_number,
                timestamp: finished_at,
                outcome: outcome.attempt_outcome(),
                status_code: outcome.status_code(),
                detail: outcome.detail().to_string(),
                duration_ms: elapsed.as_millis() as u64,
            })
            .await?;

        let Some(error) = outcome.error() else {
            tracing::info!(event_id, consumer_id, attempt = attempt_number, "Delivered");
            self.finish(&event, claimed, DeliveryStatus::Delivered, None, String::new())
                .await?;
            return Ok(DeliveryStatus::Delivered);
        };
        let detail = outcome.detail().to_string();

        let status = if !error.is_retryable() {
            tracing::warn!(
                event_id,
                consumer_id,
                attempt = attempt_number,
                error = %error,
                "Delivery rejected, not retrying"
            );
            self.finish(&event, claimed, DeliveryStatus::Failed, None, detail)
                .await?;
            DeliveryStatus::Failed
        } else if policy.allows_retry(attempt_number) {
            let retry_at = add_duration(finished_at, policy.backoff(attempt_number));
            tracing::warn!(
                event_id,
                consumer_id,
                attempt = attempt_number,
                retry_at = %retry_at,
                error = %error,
                "Delivery failed, retry scheduled"
            );
            self.finish(&event, claimed, DeliveryStatus::Failed, Some(retry_at), detail)
                .await?;
            DeliveryStatus::Failed
        } else {
            tracing::warn!(
                event_id,
                consumer_id,
                attempts = attempt_number,
                error = %error,
                "Delivery retries exhausted"
            );
            self.finish(&event, claimed, DeliveryStatus::Exhausted, None, detail)
                .await?;
            DeliveryStatus::Exhausted
        };
        Ok(status)
    }

    /// Write the delivery's new state, dead-letter it if exhausted, and
    /// settle the event when this was the last open delivery
    async fn finish(
        &self,
        event: &Event,
        claimed: &Delivery,
        status: DeliveryStatus,
        retry_at: Option<chrono::DateTime<chrono::Utc>>,
        error: String,
    ) -> Result<()> {
        let updated = self
            .store
            .update_delivery(
                &claimed.event_id,
                claimed.consumer_id(),
                DeliveryUpdate {
                    status,
                    next_attempt_at: retry_at,
                    last_error: (!error.is_empty()).then(|| error.clone()),
                    claimed_at: claimed.claimed_at,
                },
                DeliveryStatus::Delivering,
                self.clock.now(),
            )
            .await?;

        if status == DeliveryStatus::Exhausted {
            let dead_letter = DeadLetter::new(event.clone(), updated, error, self.clock.now());
            if let Err(e) = self.dlq.handle(dead_letter).await {
                tracing::error!(
                    event_id = %event.id,
                    consumer_id = %claimed.consumer_id(),
                    error = %e,
                    "Failed to hand exhausted delivery to DLQ"
                );
            }
        }

        if retry_at.is_none() {
            self.settle_event(&event.id).await?;
        }
        Ok(())
    }

    /// Move a `delivering` event to its final status once every delivery is
    /// terminal. Losing the race to another worker is not an error.
    async fn settle_event(&self, event_id: &str) -> Result<Option<EventStatus>> {
        let deliveries = self.store.list_deliveries(event_id).await?;
        let Some(final_status) = settled_status(&deliveries) else {
            return Ok(None);
        };

        match self
            .store
            .update_status(event_id, final_status, EventStatus::Delivering)
            .await
        {
            Ok(()) => {
                let attempts: u32 = deliveries.iter().map(|d| d.attempts).sum();
                tracing::info!(event_id, status = %final_status, attempts, "Event settled");
                Ok(Some(final_status))
            }
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
