//! Error types for a3s-dispatch

use thiserror::Error;

/// Errors that can occur while recording, routing, delivering, or scheduling
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Consumer has a bad or missing delivery target
    ///
    /// Routing-local: only the affected consumer is failed, other
    /// consumers of the same event are still routed.
    #[error("Configuration error for consumer '{consumer_id}': {reason}")]
    Configuration { consumer_id: String, reason: String },

    /// Network failure, timeout, or 5xx response (retry eligible)
    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    /// 4xx response (never retried)
    #[error("Permanent delivery failure: {0}")]
    PermanentDelivery(String),

    /// A conditional update lost a race against another worker
    #[error("Concurrency conflict on {entity} '{id}': expected {expected}, found {actual}")]
    ConcurrencyConflict {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    /// Retry budget of a task is spent
    #[error("Task '{task_id}' exhausted after {attempts} attempts: {last_error}")]
    TaskExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },

    /// Status change that would move a record backwards
    #[error("Invalid status transition for {entity} '{id}': {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// Event, delivery, or task not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Crate configuration error (config files, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Worker shutdown did not complete cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl DispatchError {
    /// Build a conflict error from the expected and observed states
    pub fn conflict(
        entity: &'static str,
        id: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ConcurrencyConflict {
            entity,
            id: id.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// True when the error came from a lost conditional update
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// True when retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDelivery(_) | Self::Storage(_))
    }
}

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = DispatchError::conflict("event", "evt-1", "pending", "routed");
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "Concurrency conflict on event 'evt-1': expected pending, found routed"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::TransientDelivery("503".into()).is_retryable());
        assert!(!DispatchError::PermanentDelivery("404".into()).is_retryable());
        assert!(!DispatchError::Configuration {
            consumer_id: "c1".into(),
            reason: "bad url".into(),
        }
        .is_retryable());
    }
}
