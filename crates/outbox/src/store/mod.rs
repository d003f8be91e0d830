//! Storage boundary of the outbox.
//!
//! Four capability traits, one per table family. Both backends implement all
//! of them on one type: [`InMemoryStore`] for tests and local runs,
//! [`PgStore`] for production. Outbox rows are inserted only by a
//! unit-of-work, never through these traits.
//!
//! ## Claim semantics
//!
//! `claim` takes up to `limit` rows that are PENDING, or PROCESSING with
//! `locked_until <= now` (expired lease or due retry), skipping any row that
//! has an earlier event of the same aggregate still PROCESSING with a live
//! `locked_until`. Rows come back ordered by `(aggregate_id, occurred_at, seq)`.
//! The caller then takes the per-aggregate lock and checks that what it holds
//! is a prefix of the aggregate's unfinished events before processing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use forgemes_core::{AggregateId, DeliveryId, EventId, EventTypeId, SubscriptionId, WorkerId};
use forgemes_events::EventTypeDefinition;

use crate::error::StoreError;
use crate::model::{
    AttemptRecord, EventType, OutboxEvent, OutboxStats, ReplayReport, Resolution, RetryOutcome, Subscription,
    SubscriptionSecret, SubscriptionUpdate, WebhookDelivery,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait EventTypeStore: Send + Sync {
    async fn list_event_types(&self) -> Result<Vec<EventType>, StoreError>;

    /// Insert a new type, or bump the version of an existing one.
    ///
    /// Everything but the version is fixed after the first registration. A
    /// lower version than the stored one is a `Validation` error.
    async fn register_event_type(&self, definition: &EventTypeDefinition) -> Result<EventType, StoreError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim rows for `worker` under a lease of `lease`. Increments
    /// `attempts` on every claimed row.
    async fn claim(&self, worker: WorkerId, limit: usize, lease: Duration) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Push the lease of rows still held by `worker`.
    async fn extend_lease(&self, worker: WorkerId, ids: &[EventId], lease: Duration) -> Result<u64, StoreError>;

    /// Apply the dispatcher's decisions in one transaction. Rows no longer
    /// held by `worker` are left untouched; returns how many were updated.
    async fn finalize(&self, worker: WorkerId, resolutions: &[(EventId, Resolution)]) -> Result<u64, StoreError>;

    /// Try to take the per-aggregate lock for each aggregate. Returns the
    /// aggregates now held by `worker`.
    async fn lock_aggregates(
        &self,
        worker: WorkerId,
        aggregates: &[AggregateId],
        lease: Duration,
    ) -> Result<Vec<AggregateId>, StoreError>;

    async fn release_aggregate_locks(&self, worker: WorkerId) -> Result<(), StoreError>;

    /// Ids of the first `limit` unfinished (PENDING / PROCESSING) events of
    /// an aggregate in delivery order.
    async fn aggregate_heads(&self, aggregate: AggregateId, limit: usize) -> Result<Vec<EventId>, StoreError>;

    async fn get_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError>;

    /// Operator retry: if the event is FAILED or has DEAD deliveries, put it
    /// back to PENDING and reset only the DEAD deliveries.
    async fn retry_event(&self, id: EventId, now: DateTime<Utc>) -> Result<RetryOutcome, StoreError>;

    async fn stats(&self) -> Result<OutboxStats, StoreError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        update: &SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn set_secret(
        &self,
        id: SubscriptionId,
        secret: &SubscriptionSecret,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Active subscriptions whose set contains `event_type`.
    async fn active_for_event_type(&self, event_type: EventTypeId) -> Result<Vec<Subscription>, StoreError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Create the missing `(event, subscription)` deliveries and stamp the
    /// event's `planned_at`, atomically. If the event is already planned
    /// nothing is inserted. Returns every delivery of the event.
    async fn plan_deliveries(
        &self,
        event: &OutboxEvent,
        subscriptions: &[SubscriptionId],
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    async fn deliveries_for_event(&self, event: EventId) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// PENDING and due -> IN_FLIGHT with `attempts + 1`. `None` if the
    /// delivery is not in that state any more.
    async fn begin_attempt(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<Option<WebhookDelivery>, StoreError>;

    /// Close an IN_FLIGHT attempt. Returns false if the delivery was not
    /// IN_FLIGHT.
    async fn record_attempt(&self, id: DeliveryId, record: &AttemptRecord, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Waiting delivery -> DEAD without an HTTP call (exhausted, bad
    /// configuration, subscription gone).
    async fn mark_dead(&self, id: DeliveryId, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// IN_FLIGHT deliveries last touched before `cutoff` go back to PENDING.
    async fn reclaim_stale_in_flight(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Re-send DONE events of the subscription's types that occurred in
    /// `[since, until)`: upsert a fresh PENDING delivery per event and reopen
    /// the event for the dispatcher.
    async fn replay(
        &self,
        subscription: SubscriptionId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReplayReport, StoreError>;

    /// Newest first.
    async fn recent_for_subscription(
        &self,
        subscription: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;
}

/// All storage capabilities behind trait objects.
#[derive(Clone)]
pub struct Stores {
    pub event_types: Arc<dyn EventTypeStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub deliveries: Arc<dyn DeliveryStore>,
}

impl Stores {
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            event_types: store.clone(),
            outbox: store.clone(),
            subscriptions: store.clone(),
            deliveries: store,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            event_types: store.clone(),
            outbox: store.clone(),
            subscriptions: store.clone(),
            deliveries: store,
        }
    }
}

/// Convert a std duration for timestamp arithmetic. Absurd values are
/// clamped to a century.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    let century = chrono::Duration::weeks(5200);
    chrono::Duration::from_std(d).map_or(century, |d| d.min(century))
}
