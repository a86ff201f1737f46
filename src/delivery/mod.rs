//! Delivery: getting routed events to their consumers
//!
//! - `webhook`: request building, the transport seam, response classification
//! - `signing`: HMAC-SHA256 body signatures
//! - `worker`: the pool that routes pending events and drives deliveries

pub mod signing;
pub mod webhook;
pub mod worker;

pub use webhook::{HttpTransport, TransportError, WebhookRequest, WebhookResponse, WebhookTransport};
pub use worker::{DeliveryWorkerPool, PassStats, RouteSummary, SweepStats};

use crate::error::DispatchError;
use crate::types::AttemptOutcome;

/// Result of one delivery attempt to one consumer
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Consumer acknowledged
    Delivered {
        status_code: Option<u16>,
        detail: String,
    },
    /// Consumer rejected the event; retrying won't help
    Permanent {
        status_code: Option<u16>,
        detail: String,
    },
    /// Worth retrying (5xx, timeout, connection failure)
    Transient {
        status_code: Option<u16>,
        detail: String,
        timed_out: bool,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryOutcome::Delivered { status_code, .. }
            | DeliveryOutcome::Permanent { status_code, .. }
            | DeliveryOutcome::Transient { status_code, .. } => *status_code,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            DeliveryOutcome::Delivered { detail, .. }
            | DeliveryOutcome::Permanent { detail, .. }
            | DeliveryOutcome::Transient { detail, .. } => detail,
        }
    }

    /// How the attempt is recorded in the audit trail
    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            DeliveryOutcome::Delivered { .. } => AttemptOutcome::Success,
            DeliveryOutcome::Transient {
                timed_out: true, ..
            } => AttemptOutcome::Timeout,
            _ => AttemptOutcome::Failure,
        }
    }

    /// The error this outcome represents, if any
    pub fn error(&self) -> Option<DispatchError> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Permanent { detail, .. } => {
                Some(DispatchError::PermanentDelivery(detail.clone()))
            }
            DeliveryOutcome::Transient { detail, .. } => {
                Some(DispatchError::TransientDelivery(detail.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        let ok = DeliveryOutcome::Delivered {
            status_code: Some(200),
            detail: "HTTP 200".into(),
        };
        assert!(ok.is_success());
        assert_eq!(ok.attempt_outcome(), AttemptOutcome::Success);
        assert!(ok.error().is_none());

        let timeout = DeliveryOutcome::Transient {
            status_code: None,
            detail: "timed out".into(),
            timed_out: true,
        };
        assert_eq!(timeout.attempt_outcome(), AttemptOutcome::Timeout);
        assert!(timeout.error().unwrap().is_retryable());

        let rejected = DeliveryOutcome::Permanent {
            status_code: Some(404),
            detail: "HTTP 404".into(),
        };
        assert_eq!(rejected.status_code(), Some(404));
        assert_eq!(rejected.attempt_outcome(), AttemptOutcome::Failure);
        assert!(matches!(
            rejected.error(),
            Some(DispatchError::PermanentDelivery(_))
        ));
    }
}
