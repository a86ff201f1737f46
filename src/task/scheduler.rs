//! Task scheduler
//!
//! Thin policy layer over a `TaskStore`: stamps tasks with the injected
//! clock, decides between retry and terminal failure, wakes idle workers,
//! and broadcasts `TaskEvent`s for observability.

use super::{Task, TaskEvent, TaskRequest, TaskStatus, TaskStore};
use crate::error::{DispatchError, Result};
use crate::retry::RetryPolicy;
use crate::time::{add_duration, sub_duration, Clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Capacity of the task event channel; slow subscribers lag, never block
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Accepts background jobs and hands them to workers
#[derive(Clone)]
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<TaskEvent>,
    wake: Arc<Notify>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            retry,
            clock,
            event_tx,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to task lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    /// Signal used to wake idle workers on enqueue
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Enqueue a task, returning its id
    ///
    /// If the request carries a dedup key already held by a live task, the
    /// existing task's id is returned instead.
    pub async fn enqueue(&self, request: TaskRequest) -> Result<String> {
        if request.kind.trim().is_empty() {
            return Err(DispatchError::Config("task kind cannot be empty".to_string()));
        }
        let max_attempts = request.max_attempts.unwrap_or(self.retry.max_attempts);
        if max_attempts == 0 {
            return Err(DispatchError::Config(
                "task max_attempts must be >= 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let task = Task {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            kind: request.kind,
            payload: request.payload,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts,
            scheduled_at: request
                .delay
                .map(|d| add_duration(now, d))
                .unwrap_or(now),
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            result: None,
            dedup_key: request.dedup_key,
            sequence: 0,
        };
        let candidate_id = task.id.clone();
        let kind = task.kind.clone();

        let id = self.store.enqueue(task).await?;
        if id == candidate_id {
            tracing::info!(task_id = %id, kind = %kind, "Task enqueued");
            let _ = self.event_tx.send(TaskEvent::Enqueued {
                task_id: id.clone(),
                kind,
            });
            self.wake.notify_one();
        }
        Ok(id)
    }

    /// Claim the next due task for `worker_id`
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>> {
        let claimed = self.store.claim_next(worker_id, self.clock.now()).await?;
        if let Some(task) = &claimed {
            tracing::debug!(
                task_id = %task.id,
                kind = %task.kind,
                worker_id,
                attempt = task.attempts,
                "Task claimed"
            );
            let _ = self.event_tx.send(TaskEvent::Claimed {
                task_id: task.id.clone(),
                worker_id: worker_id.to_string(),
                attempt: task.attempts,
            });
        }
        Ok(claimed)
    }

    /// Record success for a task `worker_id` is running
    ///
    /// Fails with `ConcurrencyConflict` when the worker no longer holds the
    /// claim, e.g. because its lease expired and the task was requeued.
    pub async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Task> {
        let task = self
            .store
            .complete(task_id, worker_id, result, self.clock.now())
            .await?;
        tracing::info!(
            task_id,
            worker_id,
            kind = %task.kind,
            attempts = task.attempts,
            "Task succeeded"
        );
        let _ = self.event_tx.send(TaskEvent::Succeeded {
            task_id: task_id.to_string(),
        });
        Ok(task)
    }

    /// Record a failure for a task `worker_id` is running
    ///
    /// Retriable failures with attempts left go back to the queue after a
    /// backoff delay; anything else is terminal. Like `complete`, only the
    /// current claim holder may fail the task.
    pub async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
        retriable: bool,
    ) -> Result<Task> {
        let current = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Task {}", task_id)))?;
        if current.status != TaskStatus::Running {
            return Err(DispatchError::conflict(
                "task",
                task_id,
                TaskStatus::Running,
                current.status,
            ));
        }

        let now = self.clock.now();
        let can_retry = retriable && current.attempts < current.max_attempts;
        let retry_at =
            can_retry.then(|| add_duration(now, self.retry.backoff(current.attempts)));

        // the store re-checks status and claim under its own lock
        let task = self
            .store
            .fail(task_id, worker_id, error, retry_at, now)
            .await?;
        match (retry_at, retriable) {
            (Some(retry_at), _) => {
                tracing::warn!(
                    task_id,
                    kind = %task.kind,
                    attempt = task.attempts,
                    retry_at = %retry_at,
                    error,
                    "Task failed, retry scheduled"
                );
                let _ = self.event_tx.send(TaskEvent::Retrying {
                    task_id: task_id.to_string(),
                    attempt: task.attempts,
                    retry_at,
                    error: error.to_string(),
                });
            }
            (None, true) => {
                if let Some(exhausted) = task.exhausted_error() {
                    tracing::warn!(task_id, kind = %task.kind, error = %exhausted, "Task exhausted");
                }
                let _ = self.event_tx.send(TaskEvent::Exhausted {
                    task_id: task_id.to_string(),
                    attempts: task.attempts,
                    error: error.to_string(),
                });
            }
            (None, false) => {
                tracing::warn!(task_id, kind = %task.kind, error, "Task failed permanently");
                let _ = self.event_tx.send(TaskEvent::Failed {
                    task_id: task_id.to_string(),
                    error: error.to_string(),
                });
            }
        }
        Ok(task)
    }

    /// Requeue running tasks whose claim is older than `lease`
    pub async fn requeue_stale(&self, lease: Duration) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = sub_duration(now, lease);

        let requeued = self.store.requeue_stale(cutoff, now).await?;
        for task in &requeued {
            tracing::warn!(
                task_id = %task.id,
                kind = %task.kind,
                worker_id = task.claimed_by.as_deref().unwrap_or(""),
                status = %task.status,
                "Task lease expired"
            );
            let _ = self.event_tx.send(TaskEvent::Requeued {
                task_id: task.id.clone(),
                worker_id: task.claimed_by.clone(),
            });
        }
        if !requeued.is_empty() {
            self.wake.notify_one();
        }
        Ok(requeued.len())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.get(task_id).await
    }

    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        self.store.list(status, limit).await
    }
}
