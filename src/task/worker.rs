//! Task workers
//!
//! Each worker loops claim → run handler → complete/fail. Handlers are
//! looked up by task kind and every run is bounded by the handler timeout;
//! a timed-out run counts as a retriable failure.

use super::{Task, TaskScheduler};
use crate::config::TaskConfig;
use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a handler run failed
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub message: String,
    /// Whether running the task again may succeed
    pub retriable: bool,
}

impl TaskFailure {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Executes tasks of one kind
///
/// Handlers must tolerate running the same task more than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task, returning an optional result document
    async fn handle(&self, task: &Task) -> std::result::Result<Option<serde_json::Value>, TaskFailure>;
}

type HandlerMap = HashMap<String, Arc<dyn TaskHandler>>;

#[derive(Clone)]
struct Runner {
    scheduler: TaskScheduler,
    handlers: Arc<HandlerMap>,
    handler_timeout: Duration,
}

impl Runner {
    async fn run_next(&self, worker_id: &str) -> Result<Option<Task>> {
        let Some(task) = self.scheduler.claim_next(worker_id).await? else {
            return Ok(None);
        };

        let outcome = match self.handlers.get(&task.kind) {
            None => Err(TaskFailure::permanent(format!(
                "no handler registered for kind '{}'",
                task.kind
            ))),
            Some(handler) => {
                match tokio::time::timeout(self.handler_timeout, handler.handle(&task)).await {
                    Ok(result) => result,
                    Err(_) => Err(TaskFailure::retriable(format!(
                        "handler timed out after {:?}",
                        self.handler_timeout
                    ))),
                }
            }
        };

        let finished = match outcome {
            Ok(result) => self.scheduler.complete(&task.id, worker_id, result).await,
            Err(failure) => {
                self.scheduler
                    .fail(&task.id, worker_id, &failure.message, failure.retriable)
                    .await
            }
        };

        match finished {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_conflict() => {
                // lease expired mid-run; the task was requeued or reclaimed
                tracing::warn!(task_id = %task.id, worker_id, error = %e, "Task result discarded");
                Ok(Some(task))
            }
            Err(e) => Err(e),
        }
    }
}

/// Pool of workers draining the task scheduler
pub struct TaskWorkerPool {
    runner: Runner,
    config: TaskConfig,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskWorkerPool {
    pub fn new(scheduler: TaskScheduler, config: TaskConfig) -> Self {
        Self {
            runner: Runner {
                scheduler,
                handlers: Arc::new(HashMap::new()),
                handler_timeout: config.handler_timeout(),
            },
            config,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register the handler for a task kind, replacing any previous one
    ///
    /// Registrations after `spawn` only affect workers spawned later.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        Arc::make_mut(&mut self.runner.handlers).insert(kind.into(), handler);
    }

    pub fn with_handler(mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.runner.scheduler
    }

    /// Claim and run a single task on the calling task
    ///
    /// Returns the task in its post-run state, or `None` if nothing was due.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<Task>> {
        self.runner.run_next(worker_id).await
    }

    /// Run tasks until none is due, returning how many ran
    pub async fn drain(&self, worker_id: &str) -> Result<usize> {
        let mut ran = 0;
        while self.runner.run_next(worker_id).await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Start `worker_count` background workers
    pub fn spawn(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        tracing::info!(worker_count = self.config.worker_count, "Spawning task workers");

        for n in 0..self.config.worker_count {
            let worker_id = format!("task-worker-{}", n);
            let runner = self.runner.clone();
            let cancel = self.cancel.clone();
            let poll = self.config.poll_interval();
            // one worker per pool sweeps expired leases
            let lease = (n == 0).then(|| self.config.lease_timeout());

            handles.push(tokio::spawn(async move {
                worker_loop(runner, worker_id, poll, lease, cancel).await;
            }));
        }
    }

    /// Stop workers, waiting up to `timeout` for in-flight tasks
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
                for (n, result) in results.into_iter().enumerate() {
                    if let Err(e) = result {
                        tracing::error!(worker = n, error = %e, "Task worker panicked");
                    }
                }
                tracing::info!("Task workers stopped");
                Ok(())
            }
            Err(_) => {
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "Task worker shutdown timed out");
                Err(DispatchError::Shutdown(format!(
                    "task workers still running after {:?}",
                    timeout
                )))
            }
        }
    }
}

async fn worker_loop(
    runner: Runner,
    worker_id: String,
    poll: Duration,
    lease: Option<Duration>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker_id = %worker_id, "Task worker started");
    let wake = runner.scheduler.wake_handle();

    while !cancel.is_cancelled() {
        match runner.run_next(&worker_id).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Task worker pass failed"),
        }

        if let Some(lease) = lease {
            if let Err(e) = runner.scheduler.requeue_stale(lease).await {
                tracing::error!(worker_id = %worker_id, error = %e, "Stale task sweep failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
    tracing::debug!(worker_id = %worker_id, "Task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::task::{kinds, MemoryTaskStore, TaskRequest, TaskStatus};
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(
            &self,
            task: &Task,
        ) -> std::result::Result<Option<serde_json::Value>, TaskFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(TaskFailure::retriable(format!("attempt {} failed", n)));
            }
            Ok(Some(serde_json::json!({ "kind": task.kind, "calls": n })))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(
            &self,
            _task: &Task,
        ) -> std::result::Result<Option<serde_json::Value>, TaskFailure> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
    }

    /// Stalls past its lease: another worker reclaims the task mid-run
    struct LeaseLosingHandler {
        scheduler: TaskScheduler,
        clock: ManualClock,
    }

    #[async_trait]
    impl TaskHandler for LeaseLosingHandler {
        async fn handle(
            &self,
            _task: &Task,
        ) -> std::result::Result<Option<serde_json::Value>, TaskFailure> {
            self.clock.advance(Duration::from_secs(400));
            self.scheduler
                .requeue_stale(Duration::from_secs(300))
                .await
                .unwrap();
            self.scheduler.claim_next("w2").await.unwrap().unwrap();
            Ok(Some(serde_json::json!({ "from": "w1" })))
        }
    }

    fn setup(clock: &ManualClock) -> TaskScheduler {
        TaskScheduler::new(
            Arc::new(MemoryTaskStore::new()),
            RetryPolicy::fixed(3, Duration::from_secs(1)),
            Arc::new(clock.clone()),
        )
    }

    fn config(handler_timeout_ms: u64) -> TaskConfig {
        TaskConfig {
            handler_timeout_ms,
            lease_timeout_ms: handler_timeout_ms * 10,
            poll_interval_ms: 10,
            ..TaskConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_once_success() {
        let clock = ManualClock::new();
        let scheduler = setup(&clock);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let pool = TaskWorkerPool::new(scheduler.clone(), config(1000))
            .with_handler(kinds::CHAT_ANALYSIS, handler.clone());

        let id = scheduler
            .enqueue(TaskRequest::new(kinds::CHAT_ANALYSIS, serde_json::json!({})))
            .await
            .unwrap();
        let task = pool.run_once("w1").await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result.unwrap()["calls"], 1);
        assert!(pool.run_once("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let clock = ManualClock::new();
        let scheduler = setup(&clock);
        let pool = TaskWorkerPool::new(scheduler.clone(), config(1000)).with_handler(
            kinds::DATA_SYNC,
            Arc::new(CountingHandler {
                calls: AtomicU32::new(0),
                fail_first: 1,
            }),
        );

        let id = scheduler
            .enqueue(TaskRequest::new(kinds::DATA_SYNC, serde_json::json!({})))
            .await
            .unwrap();

        let task = pool.run_once("w1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(pool.drain("w1").await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        let task = pool.run_once("w1").await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_permanently() {
        let clock = ManualClock::new();
        let scheduler = setup(&clock);
        let pool = TaskWorkerPool::new(scheduler.clone(), config(1000));

        scheduler
            .enqueue(TaskRequest::new("mystery", serde_json::json!({})))
            .await
            .unwrap();
        let task = pool.run_once("w1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn test_handler_timeout_is_retriable() {
        let clock = ManualClock::new();
        let scheduler = setup(&clock);
        let pool = TaskWorkerPool::new(scheduler.clone(), config(50))
            .with_handler(kinds::CHAT_ANALYSIS, Arc::new(SlowHandler));

        scheduler
            .enqueue(TaskRequest::new(kinds::CHAT_ANALYSIS, serde_json::json!({})))
            .await
            .unwrap();
        let task = pool.run_once("w1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_result_discarded_after_lease_lost() {
        let clock = ManualClock::new();
        let scheduler = setup(&clock);
        let pool = TaskWorkerPool::new(scheduler.clone(), config(1000)).with_handler(
            kinds::CHAT_ANALYSIS,
            Arc::new(LeaseLosingHandler {
                scheduler: scheduler.clone(),
                clock: clock.clone(),
            }),
        );

        let id = scheduler
            .enqueue(TaskRequest::new(kinds::CHAT_ANALYSIS, serde_json::json!({})))
            .await
            .unwrap();
        pool.run_once("w1").await.unwrap().unwrap();

        let task = scheduler.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.claimed_by.as_deref(), Some("w2"));
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_spawned_workers_process_and_shutdown() {
        let clock = ManualClock::new();
        let scheduler = setup(&clock);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let pool = TaskWorkerPool::new(scheduler.clone(), config(1000))
            .with_handler(kinds::CHAT_ANALYSIS, handler.clone());
        let mut events = scheduler.subscribe();
        pool.spawn();

        for _ in 0..5 {
            scheduler
                .enqueue(TaskRequest::new(kinds::CHAT_ANALYSIS, serde_json::json!({})))
                .await
                .unwrap();
        }

        let mut succeeded = 0;
        while succeeded < 5 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, crate::task::TaskEvent::Succeeded { .. }) {
                succeeded += 1;
            }
        }

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            scheduler
                .list(Some(TaskStatus::Succeeded), 10)
                .await
                .unwrap()
                .len(),
            5
        );
    }
}
