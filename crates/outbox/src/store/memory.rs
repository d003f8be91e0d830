//! In-memory backend.
//!
//! One mutex guards every table, so each trait call is atomic the same way a
//! Postgres transaction is. Aggregate locks carry an expiry instead of being
//! tied to a session: a worker that stops without releasing them loses them
//! when its lease runs out.
//!
//! Intended for tests/dev. Not optimized for performance.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use forgemes_core::{AggregateId, DeliveryId, EventId, EventTypeId, SubscriptionId, WorkerId};
use forgemes_events::EventTypeDefinition;

use super::{DeliveryStore, EventTypeStore, OutboxStore, SubscriptionStore, chrono_duration};
use crate::error::StoreError;
use crate::model::{
    AttemptRecord, DeliveryStatus, EventType, OutboxEvent, OutboxStats, OutboxStatus, ReplayReport, Resolution,
    RetryOutcome, RetryReport, Subscription, SubscriptionSecret, SubscriptionUpdate, WebhookDelivery,
};
use crate::unit_of_work::CommitReport;

#[derive(Debug)]
struct AggregateLock {
    owner: WorkerId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemState {
    event_types: BTreeMap<EventTypeId, EventType>,
    events: BTreeMap<EventId, OutboxEvent>,
    dedup: HashMap<String, EventId>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    deliveries: BTreeMap<DeliveryId, WebhookDelivery>,
    delivery_index: HashMap<(EventId, SubscriptionId), DeliveryId>,
    aggregate_locks: HashMap<AggregateId, AggregateLock>,
    next_seq: i64,
    business_rows: BTreeMap<String, serde_json::Value>,
}

impl MemState {
    fn deliveries_of(&self, event: EventId) -> Vec<WebhookDelivery> {
        self.deliveries
            .values()
            .filter(|d| d.outbox_event_id == event)
            .cloned()
            .collect()
    }

    fn webhook_enabled(&self, id: EventTypeId) -> bool {
        self.event_types.get(&id).is_some_and(|t| t.webhook_enabled)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemState>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every storage call fail with `Transient` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, MemState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("in-memory store marked unavailable".to_string()));
        }
        self.state.lock().map_err(|_| StoreError::poisoned())
    }

    /// A business row written by a committed unit-of-work.
    pub fn business_row(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().ok()?.business_rows.get(key).cloned()
    }

    /// Every outbox row in delivery order.
    pub fn all_events(&self) -> Vec<OutboxEvent> {
        let Ok(st) = self.state.lock() else {
            return Vec::new();
        };
        let mut events: Vec<_> = st.events.values().cloned().collect();
        events.sort_by_key(OutboxEvent::order_key);
        events
    }

    pub fn all_deliveries(&self) -> Vec<WebhookDelivery> {
        self.state
            .lock()
            .map(|st| st.deliveries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Write business rows and outbox rows atomically. Events whose dedup
    /// key already exists (or repeats within the batch) are skipped.
    pub(crate) fn apply_commit(
        &self,
        rows: Vec<(String, serde_json::Value)>,
        events: Vec<OutboxEvent>,
    ) -> Result<CommitReport, StoreError> {
        let mut st = self.state()?;
        let mut report = CommitReport::default();

        for event in &events {
            if !st.event_types.contains_key(&event.event_type_id) {
                return Err(StoreError::Validation(format!(
                    "event type {} is not registered",
                    event.event_type_id
                )));
            }
        }

        for (key, value) in rows {
            st.business_rows.insert(key, value);
        }
        for mut event in events {
            if let Some(key) = &event.dedup_key {
                if st.dedup.contains_key(key) {
                    report.deduplicated.push(key.clone());
                    continue;
                }
                st.dedup.insert(key.clone(), event.id);
            }
            st.next_seq += 1;
            event.seq = st.next_seq;
            report.inserted.push(event.id);
            st.events.insert(event.id, event);
        }
        Ok(report)
    }
}

fn claimable(event: &OutboxEvent, now: DateTime<Utc>) -> bool {
    match event.status {
        OutboxStatus::Pending => true,
        OutboxStatus::Processing => event.locked_until.is_none_or(|t| t <= now),
        OutboxStatus::Done | OutboxStatus::Failed => false,
    }
}

fn apply_resolution(event: &mut OutboxEvent, resolution: &Resolution, now: DateTime<Utc>) {
    match resolution {
        Resolution::Done => {
            event.status = OutboxStatus::Done;
            event.processed_at = Some(now);
            event.locked_until = None;
            event.locked_by = None;
        }
        Resolution::Defer { until, error } => {
            event.locked_until = Some(*until);
            if let Some(error) = error {
                event.last_error = Some(error.clone());
            }
        }
        Resolution::Failed { error } => {
            event.status = OutboxStatus::Failed;
            event.processed_at = Some(now);
            event.locked_until = None;
            event.locked_by = None;
            event.last_error = Some(error.clone());
        }
        Resolution::Release => {
            event.status = OutboxStatus::Pending;
            event.locked_until = None;
            event.locked_by = None;
        }
    }
    event.updated_at = now;
}

#[async_trait]
impl EventTypeStore for InMemoryStore {
    async fn list_event_types(&self) -> Result<Vec<EventType>, StoreError> {
        Ok(self.state()?.event_types.values().cloned().collect())
    }

    async fn register_event_type(&self, definition: &EventTypeDefinition) -> Result<EventType, StoreError> {
        if definition.version == 0 {
            return Err(StoreError::Validation("event type version must be >= 1".to_string()));
        }
        let mut st = self.state()?;
        if let Some(existing) = st.event_types.values_mut().find(|t| t.name == definition.name) {
            if definition.version < existing.version {
                return Err(StoreError::Validation(format!(
                    "event type {} is at version {}, cannot go back to {}",
                    existing.name, existing.version, definition.version
                )));
            }
            existing.version = definition.version;
            return Ok(existing.clone());
        }

        let event_type = EventType {
            id: EventTypeId::new(),
            name: definition.name.clone(),
            version: definition.version,
            webhook_enabled: definition.webhook_enabled,
            description: definition.description.clone(),
            created_at: Utc::now(),
        };
        st.event_types.insert(event_type.id, event_type.clone());
        Ok(event_type)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim(&self, worker: WorkerId, limit: usize, lease: Duration) -> Result<Vec<OutboxEvent>, StoreError> {
        let now = Utc::now();
        let mut st = self.state()?;

        // earliest event per aggregate that is held or waiting for a retry
        let mut barriers: HashMap<AggregateId, (DateTime<Utc>, i64)> = HashMap::new();
        for e in st.events.values() {
            if e.status == OutboxStatus::Processing && e.locked_until.is_some_and(|t| t > now) {
                let key = (e.occurred_at, e.seq);
                barriers
                    .entry(e.aggregate_id)
                    .and_modify(|b| *b = (*b).min(key))
                    .or_insert(key);
            }
        }

        let mut picked: Vec<_> = st
            .events
            .values()
            .filter(|e| claimable(e, now))
            .filter(|e| barriers.get(&e.aggregate_id).is_none_or(|b| *b > (e.occurred_at, e.seq)))
            .map(|e| (e.order_key(), e.id))
            .collect();
        picked.sort();
        picked.truncate(limit);

        let until = now + chrono_duration(lease);
        let mut claimed = Vec::with_capacity(picked.len());
        for (_, id) in picked {
            if let Some(e) = st.events.get_mut(&id) {
                e.status = OutboxStatus::Processing;
                e.locked_until = Some(until);
                e.locked_by = Some(worker);
                e.attempts += 1;
                e.updated_at = now;
                claimed.push(e.clone());
            }
        }
        Ok(claimed)
    }

    async fn extend_lease(&self, worker: WorkerId, ids: &[EventId], lease: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let until = now + chrono_duration(lease);
        let mut st = self.state()?;

        let mut extended = 0;
        for id in ids {
            if let Some(e) = st.events.get_mut(id) {
                if e.status == OutboxStatus::Processing && e.locked_by == Some(worker) {
                    e.locked_until = Some(until);
                    e.updated_at = now;
                    extended += 1;
                }
            }
        }
        for lock in st.aggregate_locks.values_mut().filter(|l| l.owner == worker) {
            lock.expires_at = until;
        }
        Ok(extended)
    }

    async fn finalize(&self, worker: WorkerId, resolutions: &[(EventId, Resolution)]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut st = self.state()?;

        let mut applied = 0;
        for (id, resolution) in resolutions {
            let Some(e) = st.events.get_mut(id) else {
                continue;
            };
            if e.status != OutboxStatus::Processing || e.locked_by != Some(worker) {
                continue;
            }
            apply_resolution(e, resolution, now);
            applied += 1;
        }
        Ok(applied)
    }

    async fn lock_aggregates(
        &self,
        worker: WorkerId,
        aggregates: &[AggregateId],
        lease: Duration,
    ) -> Result<Vec<AggregateId>, StoreError> {
        let now = Utc::now();
        let expires_at = now + chrono_duration(lease);
        let mut st = self.state()?;

        let mut acquired = Vec::with_capacity(aggregates.len());
        for aggregate in aggregates {
            match st.aggregate_locks.entry(*aggregate) {
                Entry::Occupied(mut held) => {
                    let lock = held.get_mut();
                    if lock.owner == worker || lock.expires_at <= now {
                        *lock = AggregateLock { owner: worker, expires_at };
                        acquired.push(*aggregate);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(AggregateLock { owner: worker, expires_at });
                    acquired.push(*aggregate);
                }
            }
        }
        Ok(acquired)
    }

    async fn release_aggregate_locks(&self, worker: WorkerId) -> Result<(), StoreError> {
        self.state()?.aggregate_locks.retain(|_, lock| lock.owner != worker);
        Ok(())
    }

    async fn aggregate_heads(&self, aggregate: AggregateId, limit: usize) -> Result<Vec<EventId>, StoreError> {
        let st = self.state()?;
        let mut open: Vec<_> = st
            .events
            .values()
            .filter(|e| e.aggregate_id == aggregate && !e.status.is_terminal())
            .map(|e| (e.occurred_at, e.seq, e.id))
            .collect();
        open.sort();
        Ok(open.into_iter().take(limit).map(|(_, _, id)| id).collect())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.state()?.events.get(&id).cloned())
    }

    async fn retry_event(&self, id: EventId, now: DateTime<Utc>) -> Result<RetryOutcome, StoreError> {
        let mut st = self.state()?;
        let status = st
            .events
            .get(&id)
            .map(|e| e.status)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {id}")))?;

        let dead: Vec<DeliveryId> = st
            .deliveries
            .values()
            .filter(|d| d.outbox_event_id == id && d.status == DeliveryStatus::Dead)
            .map(|d| d.id)
            .collect();
        if status != OutboxStatus::Failed && dead.is_empty() {
            return Ok(RetryOutcome::NotEligible(status));
        }

        for delivery_id in &dead {
            if let Some(d) = st.deliveries.get_mut(delivery_id) {
                d.status = DeliveryStatus::Pending;
                d.attempts = 0;
                d.next_attempt_at = now;
                d.updated_at = now;
            }
        }
        if let Some(e) = st.events.get_mut(&id) {
            e.status = OutboxStatus::Pending;
            e.locked_until = None;
            e.locked_by = None;
            e.processed_at = None;
            e.last_error = None;
            e.updated_at = now;
        }
        Ok(RetryOutcome::Reset(RetryReport {
            event_id: id,
            reset_deliveries: dead.len() as u64,
        }))
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let st = self.state()?;
        let mut stats = OutboxStats::default();
        for e in st.events.values() {
            stats.add_event(e.status, 1);
        }
        for d in st.deliveries.values() {
            stats.add_delivery(d.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut st = self.state()?;
        if st.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::Conflict(format!("subscription {} already exists", subscription.id)));
        }
        if let Some(missing) = subscription.event_types.iter().find(|t| !st.event_types.contains_key(t)) {
            return Err(StoreError::Validation(format!("event type {missing} is not registered")));
        }
        st.subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.state()?.subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.state()?.subscriptions.values().cloned().collect())
    }

    async fn update_subscription(
        &self,
        id: SubscriptionId,
        update: &SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut st = self.state()?;
        let Some(sub) = st.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(url) = &update.endpoint_url {
            sub.endpoint_url = url.clone();
        }
        if let Some(types) = &update.event_types {
            sub.event_types = types.clone();
        }
        if let Some(active) = update.active {
            sub.active = active;
        }
        if let Some(description) = &update.description {
            sub.description = Some(description.clone());
        }
        sub.updated_at = now;
        Ok(Some(sub.clone()))
    }

    async fn set_secret(
        &self,
        id: SubscriptionId,
        secret: &SubscriptionSecret,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut st = self.state()?;
        Ok(st.subscriptions.get_mut(&id).map(|sub| {
            sub.secret = secret.clone();
            sub.updated_at = now;
            sub.clone()
        }))
    }

    async fn active_for_event_type(&self, event_type: EventTypeId) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .state()?
            .subscriptions
            .values()
            .filter(|s| s.matches(event_type))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn plan_deliveries(
        &self,
        event: &OutboxEvent,
        subscriptions: &[SubscriptionId],
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut st = self.state()?;
        let stored = st
            .events
            .get(&event.id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {}", event.id)))?;

        if stored.planned_at.is_none() {
            for sub in subscriptions {
                if st.delivery_index.contains_key(&(stored.id, *sub)) {
                    continue;
                }
                let delivery = WebhookDelivery::pending(&stored, *sub, now);
                st.delivery_index.insert((stored.id, *sub), delivery.id);
                st.deliveries.insert(delivery.id, delivery);
            }
            if let Some(e) = st.events.get_mut(&event.id) {
                e.planned_at = Some(now);
            }
        }
        Ok(st.deliveries_of(event.id))
    }

    async fn deliveries_for_event(&self, event: EventId) -> Result<Vec<WebhookDelivery>, StoreError> {
        Ok(self.state()?.deliveries_of(event))
    }

    async fn begin_attempt(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<Option<WebhookDelivery>, StoreError> {
        let mut st = self.state()?;
        Ok(st.deliveries.get_mut(&id).filter(|d| d.is_due(now)).map(|d| {
            d.status = DeliveryStatus::InFlight;
            d.attempts += 1;
            d.updated_at = now;
            d.clone()
        }))
    }

    async fn record_attempt(
        &self,
        id: DeliveryId,
        record: &AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut st = self.state()?;
        let Some(d) = st.deliveries.get_mut(&id).filter(|d| d.status == DeliveryStatus::InFlight) else {
            return Ok(false);
        };
        d.status = record.status;
        d.last_response_code = record.response_code;
        d.last_error = record.error.clone();
        if let Some(next) = record.next_attempt_at {
            d.next_attempt_at = next;
        }
        if record.delivered_at.is_some() {
            d.delivered_at = record.delivered_at;
        }
        d.updated_at = now;
        Ok(true)
    }

    async fn mark_dead(&self, id: DeliveryId, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut st = self.state()?;
        let Some(d) = st.deliveries.get_mut(&id).filter(|d| d.status.is_waiting()) else {
            return Ok(false);
        };
        d.status = DeliveryStatus::Dead;
        d.last_error = Some(reason.to_string());
        d.updated_at = now;
        Ok(true)
    }

    async fn reclaim_stale_in_flight(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut st = self.state()?;
        let mut reclaimed = 0;
        for d in st
            .deliveries
            .values_mut()
            .filter(|d| d.status == DeliveryStatus::InFlight && d.updated_at < cutoff)
        {
            d.status = DeliveryStatus::Pending;
            d.next_attempt_at = now;
            d.last_error = Some("attempt abandoned by its worker".to_string());
            d.updated_at = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn replay(
        &self,
        subscription: SubscriptionId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReplayReport, StoreError> {
        let mut st = self.state()?;
        let sub = st
            .subscriptions
            .get(&subscription)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("subscription {subscription}")))?;

        let targets: Vec<OutboxEvent> = st
            .events
            .values()
            .filter(|e| e.status == OutboxStatus::Done)
            .filter(|e| sub.event_types.contains(&e.event_type_id) && st.webhook_enabled(e.event_type_id))
            .filter(|e| e.occurred_at >= since && e.occurred_at < until)
            .cloned()
            .collect();

        let mut report = ReplayReport::default();
        for event in targets {
            match st.delivery_index.get(&(event.id, subscription)).copied() {
                Some(existing) => {
                    let Some(d) = st.deliveries.get_mut(&existing) else {
                        continue;
                    };
                    if d.status == DeliveryStatus::InFlight {
                        continue;
                    }
                    d.status = DeliveryStatus::Pending;
                    d.attempts = 0;
                    d.next_attempt_at = now;
                    d.last_response_code = None;
                    d.last_error = None;
                    d.delivered_at = None;
                    d.updated_at = now;
                }
                None => {
                    let delivery = WebhookDelivery::pending(&event, subscription, now);
                    st.delivery_index.insert((event.id, subscription), delivery.id);
                    st.deliveries.insert(delivery.id, delivery);
                }
            }
            report.deliveries += 1;

            if let Some(e) = st.events.get_mut(&event.id) {
                e.status = OutboxStatus::Processing;
                e.locked_until = Some(now);
                e.locked_by = None;
                e.processed_at = None;
                e.updated_at = now;
                report.events += 1;
            }
        }
        Ok(report)
    }

    async fn recent_for_subscription(
        &self,
        subscription: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let st = self.state()?;
        let mut rows: Vec<_> = st
            .deliveries
            .values()
            .filter(|d| d.subscription_id == subscription)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgemes_core::CorrelationId;

    fn store_with_type() -> (InMemoryStore, EventTypeId) {
        let store = InMemoryStore::new();
        let id = {
            let mut st = store.state.lock().unwrap();
            let ty = EventType {
                id: EventTypeId::new(),
                name: "batch.closed".into(),
                version: 1,
                webhook_enabled: true,
                description: String::new(),
                created_at: Utc::now(),
            };
            let id = ty.id;
            st.event_types.insert(id, ty);
            id
        };
        (store, id)
    }

    fn event(ty: EventTypeId, aggregate: AggregateId, offset_ms: i64) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: EventId::new(),
            event_type_id: ty,
            event_version: 1,
            aggregate_id: aggregate,
            payload: serde_json::json!({}),
            occurred_at: now + chrono::Duration::milliseconds(offset_ms),
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
        }
    }

    #[tokio::test]
    async fn claim_orders_by_aggregate_and_time() {
        let (store, ty) = store_with_type();
        let a = AggregateId::new();
        let late = event(ty, a, 1_000);
        let early = event(ty, a, 0);
        store.apply_commit(vec![], vec![late.clone(), early.clone()]).unwrap();

        let claimed = store.claim(WorkerId::new(), 10, Duration::from_secs(30)).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
        assert!(claimed.iter().all(|e| e.attempts == 1 && e.status == OutboxStatus::Processing));
    }

    #[tokio::test]
    async fn same_instant_events_keep_insertion_order() {
        let (store, ty) = store_with_type();
        let a = AggregateId::new();
        let mut first = event(ty, a, 0);
        let mut second = event(ty, a, 0);
        second.occurred_at = first.occurred_at;
        // the later insert carries the smaller id
        let (low, high) = (first.id.min(second.id), first.id.max(second.id));
        first.id = high;
        second.id = low;
        store.apply_commit(vec![], vec![first.clone(), second.clone()]).unwrap();

        assert_eq!(store.aggregate_heads(a, 10).await.unwrap(), vec![first.id, second.id]);
        let claimed = store.claim(WorkerId::new(), 10, Duration::from_secs(30)).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(claimed[0].seq < claimed[1].seq);
    }

    #[tokio::test]
    async fn deferred_head_blocks_its_aggregate() {
        let (store, ty) = store_with_type();
        let a = AggregateId::new();
        let first = event(ty, a, 0);
        let second = event(ty, a, 10);
        store.apply_commit(vec![], vec![first.clone(), second.clone()]).unwrap();

        let worker = WorkerId::new();
        store.claim(worker, 10, Duration::from_secs(30)).await.unwrap();
        let until = Utc::now() + chrono::Duration::seconds(60);
        store
            .finalize(
                worker,
                &[
                    (first.id, Resolution::Defer { until, error: None }),
                    (second.id, Resolution::Release),
                ],
            )
            .await
            .unwrap();

        let again = store.claim(WorkerId::new(), 10, Duration::from_secs(30)).await.unwrap();
        assert!(again.is_empty(), "second event must wait for the first");
    }

    #[tokio::test]
    async fn expired_aggregate_lock_can_be_taken_over() {
        let (store, _) = store_with_type();
        let a = AggregateId::new();
        let crashed = WorkerId::new();
        let other = WorkerId::new();

        assert_eq!(store.lock_aggregates(crashed, &[a], Duration::ZERO).await.unwrap(), vec![a]);
        assert_eq!(store.lock_aggregates(other, &[a], Duration::from_secs(30)).await.unwrap(), vec![a]);
        assert!(store.lock_aggregates(crashed, &[a], Duration::from_secs(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_ignores_rows_held_by_someone_else() {
        let (store, ty) = store_with_type();
        let e = event(ty, AggregateId::new(), 0);
        store.apply_commit(vec![], vec![e.clone()]).unwrap();

        let holder = WorkerId::new();
        store.claim(holder, 1, Duration::from_secs(30)).await.unwrap();
        let applied = store.finalize(WorkerId::new(), &[(e.id, Resolution::Done)]).await.unwrap();
        assert_eq!(applied, 0);
        assert_eq!(store.get_event(e.id).await.unwrap().unwrap().status, OutboxStatus::Processing);
    }

    #[tokio::test]
    async fn unavailable_store_reports_transient() {
        let (store, _) = store_with_type();
        store.set_unavailable(true);
        let err = store.claim(WorkerId::new(), 1, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
