//! Dispatcher: the event API facade
//!
//! Wires the event store, consumer snapshots, delivery workers, task
//! scheduler and dead-letter handler together behind one handle.
//! Emitting never waits for delivery; outcomes are read back through the
//! status queries.

use crate::config::DispatchConfig;
use crate::consumer::{
    ConsumerSnapshot, ConsumerSource, MemoryConsumerSource, SnapshotHandle, SnapshotRefresher,
};
use crate::delivery::{DeliveryWorkerPool, HttpTransport, PassStats, WebhookTransport};
use crate::dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
use crate::error::{DispatchError, Result};
use crate::store::{EventStore, MemoryEventStore};
use crate::task::{
    MemoryTaskStore, Task, TaskEvent, TaskHandler, TaskRequest, TaskScheduler, TaskStore,
    TaskWorkerPool,
};
use crate::time::{Clock, SystemClock};
use crate::types::{Delivery, DeliveryAttempt, Event, EventStatus, StatusCounts};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Worker id used by `run_once` for tasks run on the caller's task
const INLINE_WORKER_ID: &str = "inline";

/// Event emission, background processing and status queries
pub struct Dispatcher {
    config: DispatchConfig,
    store: Arc<dyn EventStore>,
    refresher: Arc<SnapshotRefresher>,
    snapshots: SnapshotHandle,
    delivery: DeliveryWorkerPool,
    tasks: TaskWorkerPool,
    dlq: Arc<dyn DlqHandler>,
    cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Record an event for asynchronous delivery, returning its id
    pub async fn emit(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        tenant: &str,
    ) -> Result<String> {
        self.emit_event(Event::new(event_type, tenant, payload)).await
    }

    /// Record a pre-built event (channel, metadata, ...)
    pub async fn emit_event(&self, event: Event) -> Result<String> {
        if event.event_type.trim().is_empty() {
            return Err(DispatchError::Config("event type cannot be empty".to_string()));
        }
        if event.tenant.trim().is_empty() {
            return Err(DispatchError::Config("tenant cannot be empty".to_string()));
        }

        let event_type = event.event_type.clone();
        let tenant = event.tenant.clone();
        let event_id = self.store.record(event).await?;
        self.delivery.wake();

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            tenant = %tenant,
            "Event emitted"
        );
        Ok(event_id)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        self.store.get(event_id).await
    }

    /// Current processing status of an event
    pub async fn get_event_status(&self, event_id: &str) -> Result<EventStatus> {
        self.store
            .get(event_id)
            .await?
            .map(|event| event.status)
            .ok_or_else(|| DispatchError::NotFound(format!("Event {}", event_id)))
    }

    /// Delivery attempts for an event, oldest first
    pub async fn list_attempts(&self, event_id: &str) -> Result<Vec<DeliveryAttempt>> {
        self.store.list_attempts(event_id).await
    }

    /// Per-consumer delivery state for an event
    pub async fn list_deliveries(&self, event_id: &str) -> Result<Vec<Delivery>> {
        self.store.list_deliveries(event_id).await
    }

    /// Most recent events in a given status
    pub async fn list_events(&self, status: EventStatus, limit: usize) -> Result<Vec<Event>> {
        self.store.list_by_status(status, limit).await
    }

    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.dlq.list(limit).await
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.store.count_by_status().await
    }

    /// Consumer configuration currently used for routing
    pub fn consumers(&self) -> Arc<ConsumerSnapshot> {
        self.snapshots.current()
    }

    /// Reload consumer configuration now instead of waiting for the refresh tick
    pub async fn refresh_consumers(&self) -> Result<Arc<ConsumerSnapshot>> {
        self.refresher.refresh().await
    }

    /// Enqueue background work directly
    pub async fn enqueue_task(&self, request: TaskRequest) -> Result<String> {
        self.tasks.scheduler().enqueue(request).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.tasks.scheduler().get(task_id).await
    }

    /// Subscribe to task lifecycle events
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.tasks.scheduler().subscribe()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Start delivery workers, task workers and consumer refreshing
    pub fn start(&self) {
        let mut refresh_task = self.refresh_task.lock().unwrap_or_else(|e| e.into_inner());
        if refresh_task.is_some() || self.cancel.is_cancelled() {
            tracing::warn!("Dispatcher already started or shut down");
            return;
        }

        self.delivery.spawn();
        self.tasks.spawn();
        *refresh_task = Some(
            self.refresher
                .clone()
                .spawn(self.config.consumers.refresh_interval(), self.cancel.clone()),
        );
        tracing::info!(
            delivery_workers = self.config.delivery.worker_count,
            task_workers = self.config.tasks.worker_count,
            consumers = self.snapshots.current().len(),
            "Dispatcher started"
        );
    }

    /// One processing pass on the calling task
    ///
    /// Reclaims work whose lease expired, routes and attempts whatever is
    /// due, then runs every due task. For tests and for embedding without
    /// background workers.
    pub async fn run_once(&self) -> Result<PassStats> {
        self.delivery.sweep().await?;
        let stats = self.delivery.run_once().await?;
        self.tasks
            .scheduler()
            .requeue_stale(self.config.tasks.lease_timeout())
            .await?;
        self.tasks.drain(INLINE_WORKER_ID).await?;
        Ok(stats)
    }

    /// Stop all workers, waiting for in-flight work up to the configured timeout
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.delivery.shutdown_timeout();
        self.cancel.cancel();

        let delivery = self.delivery.shutdown(timeout).await;
        let tasks = self.tasks.shutdown(timeout).await;

        let refresh_task = self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = refresh_task {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Consumer refresher panicked");
            }
        }

        delivery?;
        tasks?;
        tracing::info!("Dispatcher stopped");
        Ok(())
    }
}

/// Assembles a `Dispatcher`; every collaborator defaults to the in-memory
/// or production implementation
pub struct DispatcherBuilder {
    config: DispatchConfig,
    store: Option<Arc<dyn EventStore>>,
    task_store: Option<Arc<dyn TaskStore>>,
    consumers: Option<Arc<dyn ConsumerSource>>,
    transport: Option<Arc<dyn WebhookTransport>>,
    dlq: Option<Arc<dyn DlqHandler>>,
    clock: Option<Arc<dyn Clock>>,
    handlers: Vec<(String, Arc<dyn TaskHandler>)>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
            store: None,
            task_store: None,
            consumers: None,
            transport: None,
            dlq: None,
            clock: None,
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn consumers(mut self, source: Arc<dyn ConsumerSource>) -> Self {
        self.consumers = Some(source);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register the handler for a task kind
    pub fn task_handler(mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((kind.into(), handler));
        self
    }

    /// Validate the configuration, load consumers, and wire everything up
    pub async fn build(self) -> Result<Dispatcher> {
        self.config.validate()?;
        let config = self.config;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryEventStore::new()));
        let task_store = self
            .task_store
            .unwrap_or_else(|| Arc::new(MemoryTaskStore::new()));
        let source = self
            .consumers
            .unwrap_or_else(|| Arc::new(MemoryConsumerSource::default()));
        let dlq = self
            .dlq
            .unwrap_or_else(|| Arc::new(MemoryDlqHandler::new(config.dlq_capacity)));
        let transport: Arc<dyn WebhookTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.delivery.user_agent)?),
        };

        let (refresher, snapshots) = SnapshotRefresher::load(source, clock.clone()).await?;

        let scheduler = TaskScheduler::new(task_store, config.tasks.retry.clone(), clock.clone());
        let mut tasks = TaskWorkerPool::new(scheduler.clone(), config.tasks.clone());
        for (kind, handler) in self.handlers {
            tasks.register(kind, handler);
        }

        let delivery = DeliveryWorkerPool::new(
            store.clone(),
            snapshots.clone(),
            transport,
            scheduler,
            dlq.clone(),
            clock,
            config.delivery.clone(),
        )
        .with_default_retry(config.retry.clone());

        tracing::debug!(consumers = snapshots.current().len(), "Dispatcher built");

        Ok(Dispatcher {
            config,
            store,
            refresher: Arc::new(refresher),
            snapshots,
            delivery,
            tasks,
            dlq,
            cancel: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        })
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerConfig, DeliveryTarget};
    use crate::delivery::{TransportError, WebhookRequest, WebhookResponse};
    use crate::task::{kinds, TaskFailure, TaskStatus};
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedTransport(u16);

    #[async_trait]
    impl WebhookTransport for FixedTransport {
        async fn send(
            &self,
            _request: WebhookRequest,
        ) -> std::result::Result<WebhookResponse, TransportError> {
            Ok(WebhookResponse {
                status_code: self.0,
                body: String::new(),
            })
        }
    }

    struct RecordingHandler {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(
            &self,
            task: &Task,
        ) -> std::result::Result<Option<serde_json::Value>, TaskFailure> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(Some(task.payload["envelope"]["type"].clone()))
        }
    }

    async fn dispatcher(consumers: Vec<ConsumerConfig>, status: u16) -> Dispatcher {
        Dispatcher::builder()
            .consumers(Arc::new(MemoryConsumerSource::new(consumers)))
            .transport(Arc::new(FixedTransport(status)))
            .clock(Arc::new(ManualClock::new()))
            .build()
            .await
            .unwrap()
    }

    fn hook(id: &str) -> ConsumerConfig {
        ConsumerConfig::new(
            id,
            "t1",
            vec!["chat.feedback".into()],
            DeliveryTarget::webhook("https://hooks.example.com/in"),
        )
    }

    #[tokio::test]
    async fn test_emit_and_query() {
        let d = dispatcher(vec![hook("c1")], 200).await;
        let id = d
            .emit("chat.feedback", serde_json::json!({"score": 4}), "t1")
            .await
            .unwrap();
        assert_eq!(d.get_event_status(&id).await.unwrap(), EventStatus::Pending);

        let stats = d.run_once().await.unwrap();
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.attempted, 1);
        assert_eq!(d.get_event_status(&id).await.unwrap(), EventStatus::Delivered);
        assert_eq!(d.list_attempts(&id).await.unwrap().len(), 1);

        let counts = d.status_counts().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.statuses[&EventStatus::Delivered], 1);
    }

    #[tokio::test]
    async fn test_emit_rejects_blank_fields() {
        let d = dispatcher(vec![], 200).await;
        assert!(d.emit("", serde_json::json!({}), "t1").await.is_err());
        assert!(d.emit("chat.feedback", serde_json::json!({}), " ").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_event_status_not_found() {
        let d = dispatcher(vec![], 200).await;
        let err = d.get_event_status("evt-missing").await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_config_default_retry_reaches_deliveries() {
        let mut config = DispatchConfig::default();
        config.retry.max_attempts = 1;
        let d = Dispatcher::builder()
            .config(config)
            .consumers(Arc::new(MemoryConsumerSource::new(vec![hook("c1")])))
            .transport(Arc::new(FixedTransport(502)))
            .clock(Arc::new(ManualClock::new()))
            .build()
            .await
            .unwrap();

        let id = d
            .emit("chat.feedback", serde_json::json!({}), "t1")
            .await
            .unwrap();
        d.run_once().await.unwrap();

        assert_eq!(d.get_event_status(&id).await.unwrap(), EventStatus::Exhausted);
        let dead = d.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event.id, id);
    }

    #[tokio::test]
    async fn test_task_consumer_runs_handler() {
        let handler = Arc::new(RecordingHandler {
            runs: AtomicUsize::new(0),
        });
        let consumer = ConsumerConfig::new(
            "analysis",
            "t1",
            vec!["chat.*".into()],
            DeliveryTarget::task(kinds::EVENT_DELIVERY),
        );
        let d = Dispatcher::builder()
            .consumers(Arc::new(MemoryConsumerSource::new(vec![consumer])))
            .transport(Arc::new(FixedTransport(200)))
            .clock(Arc::new(ManualClock::new()))
            .task_handler(kinds::EVENT_DELIVERY, handler.clone())
            .build()
            .await
            .unwrap();

        let id = d
            .emit("chat.message.created", serde_json::json!({}), "t1")
            .await
            .unwrap();
        d.run_once().await.unwrap();

        assert_eq!(d.get_event_status(&id).await.unwrap(), EventStatus::Delivered);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);

        let deliveries = d.list_deliveries(&id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        let attempts = d.list_attempts(&id).await.unwrap();
        let task_id = attempts[0].detail.trim_start_matches("enqueued ");
        let task = d.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result, Some(serde_json::json!("chat.message.created")));
    }

    #[tokio::test]
    async fn test_refresh_consumers_changes_routing() {
        let source = Arc::new(MemoryConsumerSource::new(vec![]));
        let d = Dispatcher::builder()
            .consumers(source.clone())
            .transport(Arc::new(FixedTransport(200)))
            .build()
            .await
            .unwrap();
        assert!(d.consumers().is_empty());

        source.replace(vec![hook("c1")]).unwrap();
        let snapshot = d.refresh_consumers().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(d.consumers().version, snapshot.version);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = DispatchConfig::default();
        config.delivery.poll_interval_ms = 10;
        config.tasks.poll_interval_ms = 10;
        let d = Dispatcher::builder()
            .config(config)
            .consumers(Arc::new(MemoryConsumerSource::new(vec![hook("c1")])))
            .transport(Arc::new(FixedTransport(200)))
            .build()
            .await
            .unwrap();
        d.start();

        let id = d
            .emit("chat.feedback", serde_json::json!({}), "t1")
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while d.get_event_status(&id).await.unwrap() != EventStatus::Delivered {
            assert!(tokio::time::Instant::now() < deadline, "event not delivered in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        d.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = DispatchConfig::default();
        config.delivery.worker_count = 0;
        let result = Dispatcher::builder().config(config).build().await;
        assert!(matches!(result, Err(DispatchError::Config(_))));
    }
}
