//! Producer side of the outbox.
//!
//! A unit-of-work wraps one business transaction and carries an
//! [`EventCollector`]. Producers collect events while they write their own
//! rows; `commit` inserts one outbox row per event inside the same
//! transaction and only then commits. A rollback, an early return or a
//! failed insert drops the buffer together with the business writes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, instrument};

use forgemes_core::{AggregateId, CorrelationId, DomainError, EventId};
use forgemes_events::{EnvelopeError, Event, EventCollector, EventEnvelope};

use crate::error::{StoreError, map_sqlx_error};
use crate::model::{OutboxEvent, OutboxStatus};
use crate::registry::EventTypeRegistry;
use crate::store::InMemoryStore;

#[derive(Debug, Error)]
pub enum CommitError {
    /// The event cannot enter the outbox; the business transaction is
    /// rolled back.
    #[error("producer validation failed: {0}")]
    ProducerValidation(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a successful commit wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Outbox rows inserted, in insert order.
    pub inserted: Vec<EventId>,
    /// Dedup keys that already existed; their events were skipped.
    pub deduplicated: Vec<String>,
}

#[async_trait]
pub trait UnitOfWork: Send {
    fn collector(&mut self) -> &mut EventCollector;

    fn collect(&mut self, envelope: EventEnvelope) {
        self.collector().collect(envelope);
    }

    /// Serialize a typed event and collect it.
    fn record<E: Event>(&mut self, aggregate: AggregateId, event: &E) -> Result<EventId, CommitError>
    where
        Self: Sized,
    {
        let envelope = EventEnvelope::from_typed(aggregate, event)?;
        let id = envelope.event_id();
        self.collect(envelope);
        Ok(id)
    }

    fn record_all<E: Event>(&mut self, aggregate: AggregateId, events: &[E]) -> Result<Vec<EventId>, CommitError>
    where
        Self: Sized,
    {
        events.iter().map(|event| self.record(aggregate, event)).collect()
    }

    async fn commit(self) -> Result<CommitReport, CommitError>
    where
        Self: Sized;

    async fn rollback(self) -> Result<(), CommitError>
    where
        Self: Sized;
}

/// Check every buffered envelope against the registry and build its row.
async fn outbox_rows(
    registry: &EventTypeRegistry,
    collector: &mut EventCollector,
) -> Result<Vec<OutboxEvent>, CommitError> {
    let now = Utc::now();
    let mut rows = Vec::with_capacity(collector.len());
    for envelope in collector.drain_ordered() {
        let event_type = registry
            .resolve_name(envelope.event_type())
            .await?
            .ok_or_else(|| CommitError::ProducerValidation(format!("unknown event type {:?}", envelope.event_type())))?;

        if envelope.version() == 0 || envelope.version() > event_type.version {
            return Err(CommitError::ProducerValidation(format!(
                "{} v{} is not registered (latest is v{})",
                event_type.name,
                envelope.version(),
                event_type.version
            )));
        }

        rows.push(OutboxEvent {
            id: envelope.event_id(),
            event_type_id: event_type.id,
            event_version: envelope.version(),
            aggregate_id: envelope.aggregate_id(),
            payload: envelope.payload().clone(),
            occurred_at: envelope.occurred_at(),
            seq: 0,
            status: OutboxStatus::Pending,
            attempts: 0,
            locked_until: None,
            locked_by: None,
            processed_at: None,
            planned_at: None,
            last_error: None,
            correlation_id: envelope.correlation_id(),
            causation_id: envelope.causation_id(),
            dedup_key: envelope.dedup_key().map(str::to_string),
            created_at: now,
            updated_at: now,
        });
    }
    Ok(rows)
}

/// Unit-of-work over a Postgres transaction.
///
/// Business rows are written through [`connection`](Self::connection).
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    registry: Arc<EventTypeRegistry>,
    collector: EventCollector,
}

impl PgUnitOfWork {
    pub async fn begin(pool: &PgPool, registry: Arc<EventTypeRegistry>) -> Result<Self, CommitError> {
        let tx = pool.begin().await.map_err(|e| map_sqlx_error("begin_unit_of_work", e))?;
        Ok(Self {
            tx,
            registry,
            collector: EventCollector::new(),
        })
    }

    /// Stamp every event of this unit with `correlation_id`.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.collector = EventCollector::with_correlation(correlation_id);
        self
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn collector(&mut self) -> &mut EventCollector {
        &mut self.collector
    }

    #[instrument(skip(self), fields(events = self.collector.len()), err)]
    async fn commit(mut self) -> Result<CommitReport, CommitError> {
        let rows = outbox_rows(&self.registry, &mut self.collector).await?;
        let mut report = CommitReport::default();

        for row in &rows {
            let inserted = sqlx::query(
                r#"
                INSERT INTO outbox_events (
                    id, event_type_id, event_version, aggregate_id, payload, occurred_at,
                    status, attempts, correlation_id, causation_id, dedup_key, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 0, $7, $8, $9, $10, $10)
                ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL DO NOTHING
                RETURNING id
                "#,
            )
            .bind(row.id.as_uuid())
            .bind(row.event_type_id.as_uuid())
            .bind(i32::try_from(row.event_version).unwrap_or(i32::MAX))
            .bind(row.aggregate_id.as_uuid())
            .bind(&row.payload)
            .bind(row.occurred_at)
            .bind(row.correlation_id.as_uuid())
            .bind(row.causation_id.map(uuid::Uuid::from))
            .bind(&row.dedup_key)
            .bind(row.created_at)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_outbox_event", e))?;

            match (inserted, &row.dedup_key) {
                (Some(_), _) => report.inserted.push(row.id),
                (None, Some(key)) => {
                    debug!(dedup_key = %key, "outbox event already recorded, skipped");
                    report.deduplicated.push(key.clone());
                }
                (None, None) => {
                    return Err(StoreError::Conflict(format!("outbox event {} was not inserted", row.id)).into());
                }
            }
        }

        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_unit_of_work", e))?;
        Ok(report)
    }

    async fn rollback(self) -> Result<(), CommitError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_unit_of_work", e))?;
        Ok(())
    }
}

/// Unit-of-work against [`InMemoryStore`]. Business rows are plain JSON
/// values keyed by name and become visible only on commit.
pub struct InMemoryUnitOfWork {
    store: Arc<InMemoryStore>,
    registry: Arc<EventTypeRegistry>,
    collector: EventCollector,
    rows: Vec<(String, serde_json::Value)>,
}

impl InMemoryUnitOfWork {
    pub fn new(store: Arc<InMemoryStore>, registry: Arc<EventTypeRegistry>) -> Self {
        Self {
            store,
            registry,
            collector: EventCollector::new(),
            rows: Vec::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.collector = EventCollector::with_correlation(correlation_id);
        self
    }

    /// Stage a business row write.
    pub fn put(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.rows.push((key.into(), value));
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    fn collector(&mut self) -> &mut EventCollector {
        &mut self.collector
    }

    async fn commit(mut self) -> Result<CommitReport, CommitError> {
        let events = outbox_rows(&self.registry, &mut self.collector).await?;
        Ok(self.store.apply_commit(self.rows, events)?)
    }

    async fn rollback(self) -> Result<(), CommitError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use forgemes_events::EventTypeDefinition;

    async fn setup() -> (Arc<InMemoryStore>, Arc<EventTypeRegistry>) {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(EventTypeRegistry::new(store.clone()));
        registry
            .register(&EventTypeDefinition::new("batch.closed", 2, "lot finished"))
            .await
            .unwrap();
        (store, registry)
    }

    fn envelope(version: u32, second: u32) -> EventEnvelope {
        EventEnvelope::new(
            "batch.closed",
            version,
            AggregateId::new(),
            serde_json::json!({ "produced": 10 }),
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, second).unwrap(),
        )
    }

    #[tokio::test]
    async fn commit_writes_rows_and_events_together() {
        let (store, registry) = setup().await;
        let mut uow = InMemoryUnitOfWork::new(store.clone(), registry);
        uow.put("batch/1", serde_json::json!({ "status": "closed" }));
        uow.collect(envelope(2, 0));

        let report = uow.commit().await.unwrap();
        assert_eq!(report.inserted.len(), 1);
        assert!(store.business_row("batch/1").is_some());
        assert_eq!(store.all_events()[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let (store, registry) = setup().await;
        let mut uow = InMemoryUnitOfWork::new(store.clone(), registry);
        uow.put("batch/1", serde_json::json!({}));
        uow.collect(envelope(1, 0));
        uow.rollback().await.unwrap();

        assert!(store.business_row("batch/1").is_none());
        assert!(store.all_events().is_empty());
    }

    #[tokio::test]
    async fn unknown_type_fails_the_business_transaction() {
        let (store, registry) = setup().await;
        let mut uow = InMemoryUnitOfWork::new(store.clone(), registry);
        uow.put("batch/1", serde_json::json!({}));
        uow.collect(EventEnvelope::new(
            "batch.teleported",
            1,
            AggregateId::new(),
            serde_json::json!({}),
            Utc::now(),
        ));

        let err = uow.commit().await.unwrap_err();
        assert!(matches!(err, CommitError::ProducerValidation(_)));
        assert!(store.business_row("batch/1").is_none());
    }

    #[tokio::test]
    async fn version_above_registered_is_rejected() {
        let (store, registry) = setup().await;
        let mut uow = InMemoryUnitOfWork::new(store, registry);
        uow.collect(envelope(3, 0));
        assert!(matches!(uow.commit().await, Err(CommitError::ProducerValidation(_))));
    }

    #[tokio::test]
    async fn repeated_dedup_key_is_a_silent_no_op() {
        let (store, registry) = setup().await;
        for _ in 0..2 {
            let mut uow = InMemoryUnitOfWork::new(store.clone(), registry.clone());
            uow.collect(envelope(1, 0).with_dedup_key("close-lot-7").unwrap());
            uow.commit().await.unwrap();
        }
        assert_eq!(store.all_events().len(), 1);
    }

    #[tokio::test]
    async fn events_are_inserted_in_occurrence_order() {
        let (store, registry) = setup().await;
        let mut uow = InMemoryUnitOfWork::new(store, registry);
        let late = envelope(1, 30);
        let early = envelope(1, 10);
        uow.collect(late.clone());
        uow.collect(early.clone());

        let report = uow.commit().await.unwrap();
        assert_eq!(report.inserted, vec![early.event_id(), late.event_id()]);
    }
}
