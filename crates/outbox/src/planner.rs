//! Expands a claimed outbox event into webhook deliveries.
//!
//! The set of deliveries is fixed the first time an event is planned: a
//! re-claim after a crash or a deferred retry reuses the stored rows, so a
//! subscription created in between never receives old events. Subscription
//! changes still apply to deliveries that have not been attempted yet: a
//! waiting delivery whose subscription is gone or inactive is closed as DEAD.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use forgemes_core::{EventTypeId, SubscriptionId};

use crate::error::StoreError;
use crate::model::{EventType, OutboxEvent, Subscription, WebhookDelivery};
use crate::registry::EventTypeRegistry;
use crate::store::{DeliveryStore, SubscriptionStore};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("event type {0} is not registered")]
    UnknownEventType(EventTypeId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub enum Plan {
    /// Webhooks are disabled for the type; the event is finished.
    Skip,
    Deliver {
        event_type: EventType,
        /// Deliveries to attempt now, with their subscription.
        due: Vec<(WebhookDelivery, Subscription)>,
    },
}

#[derive(Clone)]
pub struct DeliveryPlanner {
    registry: Arc<EventTypeRegistry>,
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
}

impl DeliveryPlanner {
    pub fn new(
        registry: Arc<EventTypeRegistry>,
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            deliveries,
        }
    }

    pub async fn plan(&self, event: &OutboxEvent, now: DateTime<Utc>) -> Result<Plan, PlanError> {
        let event_type = self
            .registry
            .resolve_id(event.event_type_id)
            .await?
            .ok_or(PlanError::UnknownEventType(event.event_type_id))?;

        if !event_type.webhook_enabled {
            debug!(event_id = %event.id, event_type = %event_type.name, "webhooks disabled for type");
            return Ok(Plan::Skip);
        }

        let deliveries = if event.planned_at.is_some() {
            self.deliveries.deliveries_for_event(event.id).await?
        } else {
            let targets: Vec<SubscriptionId> = self
                .subscriptions
                .active_for_event_type(event.event_type_id)
                .await?
                .into_iter()
                .map(|s| s.id)
                .collect();
            let planned = self.deliveries.plan_deliveries(event, &targets, now).await?;
            info!(
                event_id = %event.id,
                event_type = %event_type.name,
                deliveries = planned.len(),
                "event planned"
            );
            planned
        };

        let mut subscriptions: HashMap<SubscriptionId, Option<Subscription>> = HashMap::new();
        let mut due = Vec::new();
        for delivery in deliveries.into_iter().filter(|d| d.status.is_waiting()) {
            let subscription = match subscriptions.get(&delivery.subscription_id) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = self.subscriptions.get_subscription(delivery.subscription_id).await?;
                    subscriptions.insert(delivery.subscription_id, loaded.clone());
                    loaded
                }
            };

            match subscription {
                Some(sub) if sub.active => {
                    if delivery.is_due(now) {
                        due.push((delivery, sub));
                    }
                }
                Some(_) => {
                    self.deliveries
                        .mark_dead(delivery.id, "subscription is inactive", now)
                        .await?;
                    info!(delivery_id = %delivery.id, "delivery dropped: subscription inactive");
                }
                None => {
                    self.deliveries
                        .mark_dead(delivery.id, "subscription no longer exists", now)
                        .await?;
                    info!(delivery_id = %delivery.id, "delivery dropped: subscription missing");
                }
            }
        }

        Ok(Plan::Deliver { event_type, due })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryStatus, OutboxStatus, SubscriptionSecret, SubscriptionUpdate};
    use crate::store::{InMemoryStore, OutboxStore};
    use forgemes_core::{AggregateId, CorrelationId, EventId};
    use forgemes_events::EventTypeDefinition;

    struct Fixture {
        store: Arc<InMemoryStore>,
        planner: DeliveryPlanner,
        event_type: EventType,
    }

    async fn fixture(definition: EventTypeDefinition) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(EventTypeRegistry::new(store.clone()));
        let event_type = registry.register(&definition).await.unwrap();
        let planner = DeliveryPlanner::new(registry, store.clone(), store.clone());
        Fixture {
            store,
            planner,
            event_type,
        }
    }

    async fn subscribe(store: &InMemoryStore, event_type: EventTypeId) -> Subscription {
        let now = Utc::now();
        let sub = Subscription {
            id: SubscriptionId::new(),
            endpoint_url: "http://127.0.0.1:9/hook".into(),
            secret: SubscriptionSecret::generate(),
            event_types: [event_type].into_iter().collect(),
            active: true,
            description: None,
            created_at: now,
            updated_at: now,
        };
        store.create_subscription(&sub).await.unwrap();
        sub
    }

    fn outbox_event(store: &InMemoryStore, event_type: EventTypeId) -> OutboxEvent {
        let now = Utc::now();
        let event = OutboxEvent {
            id: EventId::new(),
            event_type_id: event_type,
            event_version: 1,
            aggregate_id: AggregateId::new(),
            payload: serde_json::json!({ "lot": "L-1" }),
            occurred_at: now,
            seq: 0,
            status: OutboxStatus::Pending,
            attempts: 0,
            locked_until: None,
            locked_by: None,
            processed_at: None,
            planned_at: None,
            last_error: None,
            correlation_id: CorrelationId::new(),
            causation_id: None,
            dedup_key: None,
            created_at: now,
            updated_at: now,
        };
        store.apply_commit(vec![], vec![event.clone()]).unwrap();
        event
    }

    #[tokio::test]
    async fn disabled_type_is_skipped() {
        let f = fixture(EventTypeDefinition::new("work_center.created", 1, "").internal()).await;
        subscribe(&f.store, f.event_type.id).await;
        let event = outbox_event(&f.store, f.event_type.id);

        assert!(matches!(f.planner.plan(&event, Utc::now()).await.unwrap(), Plan::Skip));
        assert!(f.store.all_deliveries().is_empty());
    }

    #[tokio::test]
    async fn replanning_reuses_the_first_plan() {
        let f = fixture(EventTypeDefinition::new("batch.closed", 1, "")).await;
        subscribe(&f.store, f.event_type.id).await;
        let event = outbox_event(&f.store, f.event_type.id);
        f.planner.plan(&event, Utc::now()).await.unwrap();

        // a subscription added after planning does not join the event
        subscribe(&f.store, f.event_type.id).await;
        let replanned = f.store.get_event(event.id).await.unwrap().unwrap();
        let Plan::Deliver { due, .. } = f.planner.plan(&replanned, Utc::now()).await.unwrap() else {
            panic!("expected deliveries");
        };
        assert_eq!(due.len(), 1);
        assert_eq!(f.store.all_deliveries().len(), 1);
    }

    #[tokio::test]
    async fn deactivated_subscription_gets_its_waiting_delivery_closed() {
        let f = fixture(EventTypeDefinition::new("batch.closed", 1, "")).await;
        let sub = subscribe(&f.store, f.event_type.id).await;
        let event = outbox_event(&f.store, f.event_type.id);
        f.planner.plan(&event, Utc::now()).await.unwrap();

        let off = SubscriptionUpdate {
            active: Some(false),
            ..SubscriptionUpdate::default()
        };
        f.store.update_subscription(sub.id, &off, Utc::now()).await.unwrap();

        let replanned = f.store.get_event(event.id).await.unwrap().unwrap();
        let Plan::Deliver { due, .. } = f.planner.plan(&replanned, Utc::now()).await.unwrap() else {
            panic!("expected deliveries");
        };
        assert!(due.is_empty());
        let delivery = &f.store.all_deliveries()[0];
        assert_eq!(delivery.status, DeliveryStatus::Dead);
        assert_eq!(delivery.attempts, 0);
    }

    #[tokio::test]
    async fn unknown_type_is_reported() {
        let f = fixture(EventTypeDefinition::new("batch.closed", 1, "")).await;
        let mut event = outbox_event(&f.store, f.event_type.id);
        event.event_type_id = EventTypeId::new();
        assert!(matches!(
            f.planner.plan(&event, Utc::now()).await,
            Err(PlanError::UnknownEventType(_))
        ));
    }
}
