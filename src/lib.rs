//! # a3s-dispatch
//!
//! Event routing, webhook delivery, and background task dispatch for the
//! A3S ecosystem.
//!
//! ## Overview
//!
//! Request handlers `emit` events and return immediately. Worker pools
//! route each event to the consumers configured for its tenant and type,
//! deliver it (webhook POST or internal task), and retry transient failures
//! with exponential backoff. Outcomes are read back through status queries.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_dispatch::{ConsumerConfig, DeliveryTarget, Dispatcher, MemoryConsumerSource};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_dispatch::Result<()> {
//! let consumers = MemoryConsumerSource::new(vec![ConsumerConfig::new(
//!     "crm-hook",
//!     "t1",
//!     vec!["chat.feedback".to_string()],
//!     DeliveryTarget::webhook("https://crm.example.com/hooks/feedback"),
//! )]);
//!
//! let dispatcher = Dispatcher::builder()
//!     .consumers(Arc::new(consumers))
//!     .build()
//!     .await?;
//! dispatcher.start();
//!
//! let event_id = dispatcher
//!     .emit("chat.feedback", serde_json::json!({"score": 5}), "t1")
//!     .await?;
//!
//! println!("{}: {}", event_id, dispatcher.get_event_status(&event_id).await?);
//! dispatcher.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **EventStore**: events, per-consumer deliveries, and the attempt log,
//!   mutated only through compare-and-set updates
//! - **EventRouter**: pure matching of an event against a consumer snapshot
//! - **DeliveryWorkerPool**: claims pending events and due deliveries,
//!   and sweeps claims whose lease expired
//! - **TaskScheduler** / **TaskWorkerPool**: background jobs with retry,
//!   dedup, and stale-lease recovery
//! - **Dispatcher**: the facade tying it together

pub mod config;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod retry;
pub mod router;
pub mod store;
pub mod task;
pub mod time;
pub mod types;

// Re-export core types
pub use config::{ConsumerRefreshConfig, DeliveryConfig, DispatchConfig, TaskConfig};
pub use consumer::{
    ConsumerConfig, ConsumerSnapshot, ConsumerSource, DeliveryTarget, FileConsumerSource,
    MemoryConsumerSource, SnapshotHandle, SnapshotRefresher,
};
pub use delivery::{
    DeliveryOutcome, DeliveryWorkerPool, HttpTransport, PassStats, RouteSummary, SweepStats,
    TransportError, WebhookRequest, WebhookResponse, WebhookTransport,
};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
pub use error::{DispatchError, Result};
pub use retry::RetryPolicy;
pub use router::{EventRouter, RoutePlan};
pub use store::{EventStore, MemoryEventStore};
pub use task::{
    MemoryTaskStore, Task, TaskEvent, TaskFailure, TaskHandler, TaskRequest, TaskScheduler,
    TaskStatus, TaskStore, TaskWorkerPool,
};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{
    AttemptOutcome, Delivery, DeliveryAttempt, DeliveryStatus, Envelope, Event, EventStatus,
    StatusCounts,
};
