//! Task persistence
//!
//! Claims and completions are conditional updates: `claim_next` only takes
//! due, claimable tasks and `complete`/`fail` only act on tasks still
//! running under the caller's claim.

use super::{Task, TaskStatus};
use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Task storage trait
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task, returning its id
    ///
    /// When `dedup_key` matches a non-terminal task, nothing is inserted and
    /// the existing id is returned.
    async fn enqueue(&self, task: Task) -> Result<String>;

    /// Atomically move the oldest due task to `running` for `worker_id`
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>>;

    /// Mark a task running under `worker_id`'s claim succeeded
    async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    /// Mark a task running under `worker_id`'s claim failed
    ///
    /// With `retry_at` the task becomes `retrying` and is claimable again
    /// from that time; without it the task is terminally `failed`.
    async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    /// Return running tasks claimed before `claimed_before` to `retrying`
    ///
    /// Tasks that already used their last attempt become `failed` instead.
    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Tasks in creation order, optionally filtered by status
    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>>;
}

#[derive(Default)]
struct TaskState {
    next_sequence: u64,
    tasks: HashMap<String, Task>,
    /// dedup key → id of the live task holding it
    dedup: HashMap<String, String>,
}

impl TaskState {
    fn release_dedup(&mut self, task: &Task) {
        if let Some(key) = &task.dedup_key {
            if self.dedup.get(key) == Some(&task.id) {
                self.dedup.remove(key);
            }
        }
    }
}

/// In-memory task store
#[derive(Default)]
pub struct MemoryTaskStore {
    state: RwLock<TaskState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, TaskState>> {
        self.state
            .read()
            .map_err(|e| DispatchError::Storage(format!("Task store lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, TaskState>> {
        self.state
            .write()
            .map_err(|e| DispatchError::Storage(format!("Task store lock poisoned: {}", e)))
    }
}

/// The task, if it is still running under `worker_id`'s claim
///
/// A worker whose lease expired must not settle the run of whoever
/// claimed the task after it.
fn claimed_by<'a>(
    state: &'a mut TaskState,
    task_id: &str,
    worker_id: &str,
) -> Result<&'a mut Task> {
    let task = state
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| DispatchError::NotFound(format!("Task {}", task_id)))?;
    if task.status != TaskStatus::Running {
        return Err(DispatchError::conflict(
            "task",
            task_id,
            TaskStatus::Running,
            task.status,
        ));
    }
    if task.claimed_by.as_deref() != Some(worker_id) {
        return Err(DispatchError::conflict(
            "task",
            task_id,
            format!("claim by {}", worker_id),
            format!(
                "claim by {}",
                task.claimed_by.as_deref().unwrap_or("nobody")
            ),
        ));
    }
    Ok(task)
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn enqueue(&self, mut task: Task) -> Result<String> {
        let mut state = self.write()?;

        if let Some(key) = &task.dedup_key {
            if let Some(existing) = state.dedup.get(key) {
                tracing::debug!(task_id = %existing, dedup_key = %key, "Task already in flight");
                return Ok(existing.clone());
            }
        }
        if state.tasks.contains_key(&task.id) {
            return Err(DispatchError::Storage(format!(
                "Task {} already exists",
                task.id
            )));
        }

        state.next_sequence += 1;
        task.sequence = state.next_sequence;
        task.status = TaskStatus::Queued;

        let id = task.id.clone();
        if let Some(key) = &task.dedup_key {
            state.dedup.insert(key.clone(), id.clone());
        }
        state.tasks.insert(id.clone(), task);
        Ok(id)
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut state = self.write()?;

        let next_id = state
            .tasks
            .values()
            .filter(|t| t.status.is_claimable() && t.scheduled_at <= now)
            .min_by(|a, b| {
                a.scheduled_at
                    .cmp(&b.scheduled_at)
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|t| t.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };

        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.claimed_by = Some(worker_id.to_string());
        task.claimed_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut state = self.write()?;
        let task = claimed_by(&mut state, task_id, worker_id)?;
        task.status = TaskStatus::Succeeded;
        task.result = result;
        task.last_error = None;
        task.updated_at = now;
        let task = task.clone();
        state.release_dedup(&task);
        Ok(task)
    }

    async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let mut state = self.write()?;
        let task = claimed_by(&mut state, task_id, worker_id)?;
        task.last_error = Some(error.to_string());
        task.updated_at = now;
        task.claimed_by = None;
        task.claimed_at = None;
        match retry_at {
            Some(at) => {
                task.status = TaskStatus::Retrying;
                task.scheduled_at = at;
            }
            None => task.status = TaskStatus::Failed,
        }
        let task = task.clone();
        if task.status.is_terminal() {
            state.release_dedup(&task);
        }
        Ok(task)
    }

    async fn requeue_stale(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let mut state = self.write()?;
        let mut requeued = Vec::new();
        for task in state.tasks.values_mut() {
            let stale = task.status == TaskStatus::Running
                && task.claimed_at.is_some_and(|at| at < claimed_before);
            if !stale {
                continue;
            }
            // a lease that expires on the last attempt ends the task
            task.status = if task.attempts >= task.max_attempts {
                TaskStatus::Failed
            } else {
                TaskStatus::Retrying
            };
            task.scheduled_at = now;
            task.last_error = Some(format!(
                "lease expired while held by {}",
                task.claimed_by.as_deref().unwrap_or("unknown worker")
            ));
            task.updated_at = now;
            requeued.push(task.clone());
            task.claimed_by = None;
            task.claimed_at = None;
        }
        for task in requeued.iter().filter(|t| t.status.is_terminal()) {
            state.release_dedup(task);
        }
        Ok(requeued)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.read()?.tasks.get(task_id).cloned())
    }

    async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let state = self.read()?;
        let mut tasks: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks.into_iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(kind: &str, at: DateTime<Utc>) -> Task {
        Task {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            kind: kind.to_string(),
            payload: serde_json::json!({}),
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: 3,
            scheduled_at: at,
            created_at: at,
            updated_at: at,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            result: None,
            dedup_key: None,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn test_claim_fifo_by_scheduled_at() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let later = store.enqueue(task("a", now)).await.unwrap();
        let earlier = store
            .enqueue(task("b", now - Duration::seconds(5)))
            .await
            .unwrap();

        let first = store.claim_next("w1", now).await.unwrap().unwrap();
        assert_eq!(first.id, earlier);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));

        let second = store.claim_next("w2", now).await.unwrap().unwrap();
        assert_eq!(second.id, later);
        assert!(store.claim_next("w3", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_future_tasks() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        store
            .enqueue(task("a", now + Duration::seconds(10)))
            .await
            .unwrap();

        assert!(store.claim_next("w1", now).await.unwrap().is_none());
        assert!(store
            .claim_next("w1", now + Duration::seconds(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let id = store.enqueue(task("a", now)).await.unwrap();

        assert!(store.complete(&id, "w1", None, now).await.unwrap_err().is_conflict());

        store.claim_next("w1", now).await.unwrap();
        let done = store
            .complete(&id, "w1", Some(serde_json::json!({"ok": true})), now)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert!(store.complete(&id, "w1", None, now).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_rejects_other_worker() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let id = store.enqueue(task("a", now)).await.unwrap();
        store.claim_next("w1", now).await.unwrap();

        let err = store.complete(&id, "w2", None, now).await.unwrap_err();
        assert!(err.is_conflict());
        let err = store.fail(&id, "w2", "boom", None, now).await.unwrap_err();
        assert!(err.is_conflict());

        let t = store.get(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_settle_reclaimed_task() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let id = store.enqueue(task("a", now)).await.unwrap();
        store.claim_next("w1", now).await.unwrap();

        let later = now + Duration::seconds(400);
        store
            .requeue_stale(later - Duration::seconds(300), later)
            .await
            .unwrap();
        store.claim_next("w2", later).await.unwrap().unwrap();

        assert!(store.complete(&id, "w1", None, later).await.unwrap_err().is_conflict());
        assert!(store
            .fail(&id, "w1", "late", None, later)
            .await
            .unwrap_err()
            .is_conflict());

        let t = store.get(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.claimed_by.as_deref(), Some("w2"));

        let done = store.complete(&id, "w2", None, later).await.unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_with_and_without_retry() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let id = store.enqueue(task("a", now)).await.unwrap();
        store.claim_next("w1", now).await.unwrap();

        let retry_at = now + Duration::seconds(30);
        let t = store.fail(&id, "w1", "boom", Some(retry_at), now).await.unwrap();
        assert_eq!(t.status, TaskStatus::Retrying);
        assert_eq!(t.scheduled_at, retry_at);
        assert!(t.claimed_by.is_none());

        assert!(store.claim_next("w1", now).await.unwrap().is_none());
        let again = store.claim_next("w1", retry_at).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);

        let t = store.fail(&id, "w1", "boom", None, retry_at).await.unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_dedup_key_while_in_flight() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let mut a = task("data-sync", now);
        a.dedup_key = Some("sync:ds-1".into());
        let mut b = task("data-sync", now);
        b.dedup_key = Some("sync:ds-1".into());
        let mut c = task("data-sync", now);
        c.dedup_key = Some("sync:ds-1".into());

        let first = store.enqueue(a).await.unwrap();
        assert_eq!(store.enqueue(b).await.unwrap(), first);
        assert_eq!(store.list(None, 10).await.unwrap().len(), 1);

        store.claim_next("w1", now).await.unwrap();
        store.complete(&first, "w1", None, now).await.unwrap();

        // key released once terminal
        let second = store.enqueue(c).await.unwrap();
        assert_ne!(second, first);
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let id = store.enqueue(task("a", now)).await.unwrap();
        store.claim_next("w1", now).await.unwrap();

        let later = now + Duration::minutes(10);
        assert!(store
            .requeue_stale(now - Duration::seconds(1), later)
            .await
            .unwrap()
            .is_empty());

        let requeued = store
            .requeue_stale(later - Duration::minutes(5), later)
            .await
            .unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].claimed_by.as_deref(), Some("w1"));

        let t = store.get(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Retrying);
        assert!(t.claimed_by.is_none());
        assert!(store.claim_next("w2", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_requeue_stale_last_attempt_fails() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let mut t = task("a", now);
        t.max_attempts = 1;
        let id = store.enqueue(t).await.unwrap();
        store.claim_next("w1", now).await.unwrap();

        let later = now + Duration::minutes(10);
        let requeued = store.requeue_stale(later, later).await.unwrap();
        assert_eq!(requeued[0].status, TaskStatus::Failed);
        assert!(store.get(&id).await.unwrap().unwrap().is_exhausted());
        assert!(store.claim_next("w2", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        store.enqueue(task("a", now)).await.unwrap();
        store.enqueue(task("b", now)).await.unwrap();
        store.claim_next("w1", now).await.unwrap();

        assert_eq!(store.list(Some(TaskStatus::Running), 10).await.unwrap().len(), 1);
        assert_eq!(store.list(Some(TaskStatus::Queued), 10).await.unwrap().len(), 1);
        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);
    }
}
