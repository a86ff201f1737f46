//! Event router
//!
//! Pure computation over a consumer snapshot: given an event, decide which
//! consumers should receive it. The router never touches the store.

use crate::consumer::{ConsumerConfig, ConsumerSnapshot};
use crate::error::DispatchError;
use crate::types::Event;

/// Outcome of routing one event
#[derive(Debug, Default)]
pub struct RoutePlan {
    /// Consumers with a valid target, ordered by consumer id
    pub routes: Vec<ConsumerConfig>,

    /// Matched consumers whose target is malformed, with the reason
    pub rejected: Vec<(ConsumerConfig, DispatchError)>,
}

impl RoutePlan {
    /// No consumer matched at all
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.rejected.is_empty()
    }

    /// Total matched consumers, valid or not
    pub fn matched(&self) -> usize {
        self.routes.len() + self.rejected.len()
    }
}

/// Matches events to enabled consumers of the same tenant
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRouter;

impl EventRouter {
    pub fn new() -> Self {
        Self
    }

    /// Route an event against a snapshot
    ///
    /// A channel-scoped event goes to consumers registered for that channel
    /// when there are any, and falls back to tenant-level consumers (no
    /// channel) otherwise. Events without a channel only reach tenant-level
    /// consumers.
    pub fn route(&self, event: &Event, snapshot: &ConsumerSnapshot) -> RoutePlan {
        let candidates: Vec<&ConsumerConfig> = snapshot
            .for_tenant(&event.tenant)
            .filter(|c| c.enabled && c.accepts(&event.event_type))
            .collect();

        let channel_scoped: Vec<&ConsumerConfig> = match event.channel.as_deref() {
            Some(channel) => candidates
                .iter()
                .copied()
                .filter(|c| c.channel.as_deref() == Some(channel))
                .collect(),
            None => Vec::new(),
        };

        let mut selected = if channel_scoped.is_empty() {
            candidates
                .into_iter()
                .filter(|c| c.channel.is_none())
                .collect()
        } else {
            channel_scoped
        };
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        selected.dedup_by(|a, b| a.id == b.id);

        let mut plan = RoutePlan::default();
        for consumer in selected {
            match consumer.validate_target() {
                Ok(()) => plan.routes.push(consumer.clone()),
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.id,
                        consumer_id = %consumer.id,
                        error = %e,
                        "Consumer rejected during routing"
                    );
                    plan.rejected.push((consumer.clone(), e));
                }
            }
        }

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant = %event.tenant,
            routes = plan.routes.len(),
            rejected = plan.rejected.len(),
            snapshot_version = snapshot.version,
            "Route plan computed"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::DeliveryTarget;
    use chrono::Utc;

    fn consumer(id: &str, tenant: &str, types: &[&str]) -> ConsumerConfig {
        ConsumerConfig::new(
            id,
            tenant,
            types.iter().map(|t| t.to_string()).collect(),
            DeliveryTarget::webhook(format!("https://hooks.example.com/{}", id)),
        )
    }

    fn snapshot(consumers: Vec<ConsumerConfig>) -> ConsumerSnapshot {
        ConsumerSnapshot::new(1, Utc::now(), consumers)
    }

    fn ids(plan: &RoutePlan) -> Vec<&str> {
        plan.routes.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_route_exact_match() {
        let snap = snapshot(vec![
            consumer("c1", "t1", &["chat.feedback"]),
            consumer("c2", "t1", &["chat.message.created"]),
        ]);
        let event = Event::new("chat.feedback", "t1", serde_json::json!({}));

        let plan = EventRouter::new().route(&event, &snap);
        assert_eq!(ids(&plan), vec!["c1"]);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn test_route_no_match_is_empty() {
        let snap = snapshot(vec![consumer("c1", "t1", &["chat.feedback"])]);
        let event = Event::new("datastore.sync.requested", "t1", serde_json::json!({}));
        assert!(EventRouter::new().route(&event, &snap).is_empty());
    }

    #[test]
    fn test_route_respects_tenant_and_enabled() {
        let snap = snapshot(vec![
            consumer("c1", "t2", &["chat.*"]),
            consumer("c2", "t1", &["chat.*"]).with_enabled(false),
            consumer("c3", "t1", &["*"]),
        ]);
        let event = Event::new("chat.feedback", "t1", serde_json::json!({}));
        assert_eq!(ids(&EventRouter::new().route(&event, &snap)), vec!["c3"]);
    }

    #[test]
    fn test_route_order_is_deterministic() {
        let snap = snapshot(vec![
            consumer("zeta", "t1", &["chat.*"]),
            consumer("alpha", "t1", &["chat.feedback"]),
            consumer("mid", "t1", &["*"]),
        ]);
        let event = Event::new("chat.feedback", "t1", serde_json::json!({}));
        assert_eq!(
            ids(&EventRouter::new().route(&event, &snap)),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[test]
    fn test_route_malformed_target_rejected_others_kept() {
        let mut bad = consumer("bad", "t1", &["chat.*"]);
        bad.target = DeliveryTarget::webhook("not a url");
        let snap = snapshot(vec![bad, consumer("good", "t1", &["chat.*"])]);
        let event = Event::new("chat.feedback", "t1", serde_json::json!({}));

        let plan = EventRouter::new().route(&event, &snap);
        assert_eq!(ids(&plan), vec!["good"]);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].0.id, "bad");
        assert!(matches!(
            plan.rejected[0].1,
            DispatchError::Configuration { .. }
        ));
        assert_eq!(plan.matched(), 2);
    }

    #[test]
    fn test_route_channel_specific_preferred() {
        let snap = snapshot(vec![
            consumer("tenant-wide", "t1", &["chat.*"]),
            consumer("web-only", "t1", &["chat.*"]).with_channel("web"),
        ]);

        let web = Event::new("chat.feedback", "t1", serde_json::json!({})).with_channel("web");
        assert_eq!(ids(&EventRouter::new().route(&web, &snap)), vec!["web-only"]);

        // no consumer for this channel: fall back to tenant-level
        let slack =
            Event::new("chat.feedback", "t1", serde_json::json!({})).with_channel("slack");
        assert_eq!(
            ids(&EventRouter::new().route(&slack, &snap)),
            vec!["tenant-wide"]
        );

        let plain = Event::new("chat.feedback", "t1", serde_json::json!({}));
        assert_eq!(
            ids(&EventRouter::new().route(&plain, &snap)),
            vec!["tenant-wide"]
        );
    }
}
