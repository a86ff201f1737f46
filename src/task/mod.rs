//! Background task scheduling
//!
//! Tasks are units of work decoupled from the request path (chat analysis,
//! data-store sync, internal event delivery). The scheduler guarantees
//! at-least-once execution: a task is claimed by exactly one worker at a
//! time, and failures are retried with backoff until the budget runs out.

pub mod scheduler;
pub mod store;
pub mod worker;

pub use scheduler::TaskScheduler;
pub use store::{MemoryTaskStore, TaskStore};
pub use worker::{TaskFailure, TaskHandler, TaskWorkerPool};

use crate::error::DispatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Built-in task kinds
pub mod kinds {
    /// Post-conversation analysis of a chat
    pub const CHAT_ANALYSIS: &str = "chat-analysis";
    /// Synchronize a client's data store with the search index
    pub const DATA_SYNC: &str = "data-sync";
    /// Event handed to an internal consumer
    pub const EVENT_DELIVERY: &str = "event-delivery";
}

/// Task lifecycle state
///
/// `queued → running → {succeeded | retrying | failed}`; a retrying task is
/// claimable again once its `scheduled_at` has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl TaskStatus {
    /// Whether a worker may claim a task in this state
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Retrying)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// A unit of background work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier (task-<uuid>)
    pub id: String,
    pub kind: String,
    /// Input for the handler, typically a reference to the real data
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the task may be claimed
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Handler output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// At most one non-terminal task exists per key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// Store-assigned insertion order, breaks `scheduled_at` ties
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    /// True when the task failed because it ran out of attempts
    pub fn is_exhausted(&self) -> bool {
        self.status == TaskStatus::Failed && self.attempts >= self.max_attempts
    }

    /// Terminal error for an exhausted task
    pub fn exhausted_error(&self) -> Option<DispatchError> {
        self.is_exhausted().then(|| DispatchError::TaskExhausted {
            task_id: self.id.clone(),
            attempts: self.attempts,
            last_error: self.last_error.clone().unwrap_or_default(),
        })
    }
}

/// What a caller asks the scheduler to run
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub kind: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
    /// Delay before the first claim
    pub delay: Option<Duration>,
    /// Overrides the scheduler's retry budget
    pub max_attempts: Option<u32>,
}

impl TaskRequest {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            dedup_key: None,
            delay: None,
            max_attempts: None,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Scheduler lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Enqueued {
        task_id: String,
        kind: String,
    },
    Claimed {
        task_id: String,
        worker_id: String,
        attempt: u32,
    },
    Succeeded {
        task_id: String,
    },
    /// Will run again at `retry_at`
    Retrying {
        task_id: String,
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// Non-retriable failure
    Failed {
        task_id: String,
        error: String,
    },
    /// Retriable failure with no attempts left
    Exhausted {
        task_id: String,
        attempts: u32,
        error: String,
    },
    /// Lease expired while running
    Requeued {
        task_id: String,
        worker_id: Option<String>,
    },
}
