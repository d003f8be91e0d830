//! Postgres backend.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! each other's rows. Per-aggregate ordering uses session-level advisory
//! locks, keyed by `(namespace, hashtext(aggregate_id))`, taken on one
//! dedicated connection per worker: the locks survive across the claim and
//! finalize transactions and are dropped by the server if the worker's
//! process dies.
//!
//! Leases are computed from the database clock (`now()`); delivery schedules
//! come from the dispatcher's clock.
//!
//! ## Thread Safety
//!
//! `PgStore` is `Send + Sync`. The pool handles connection sharing; the lock
//! sessions sit behind their own async mutexes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::instrument;

use forgemes_core::{
    AggregateId, CorrelationId, DeliveryId, EventId, EventTypeId, SubscriptionId, WorkerId,
};

use crate::error::{StoreError, map_sqlx_error};
use crate::model::{
    DeliveryStatus, EventType, OutboxEvent, OutboxStatus, Subscription, SubscriptionSecret, WebhookDelivery,
};

mod deliveries;
mod outbox;

const SCHEMA: &str = include_str!("schema.sql");

/// First key of every aggregate advisory lock, so they cannot collide with
/// advisory locks taken by other applications on the same database.
const AGGREGATE_LOCK_NAMESPACE: i32 = 0x4f42_5831;

type LockSession = Arc<tokio::sync::Mutex<PoolConnection<Postgres>>>;

pub struct PgStore {
    pool: PgPool,
    lock_sessions: Mutex<HashMap<WorkerId, LockSession>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn install_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("install_schema", e))?;
        Ok(())
    }

    /// The dedicated advisory-lock connection of `worker`, opened on first use.
    async fn lock_session(&self, worker: WorkerId) -> Result<LockSession, StoreError> {
        if let Some(session) = self.sessions()?.get(&worker) {
            return Ok(session.clone());
        }
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_lock_session", e))?;
        let fresh = Arc::new(tokio::sync::Mutex::new(conn));
        Ok(self.sessions()?.entry(worker).or_insert(fresh).clone())
    }

    fn drop_lock_session(&self, worker: WorkerId) {
        if let Ok(mut sessions) = self.lock_sessions.lock() {
            sessions.remove(&worker);
        }
    }

    fn sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<WorkerId, LockSession>>, StoreError> {
        self.lock_sessions.lock().map_err(|_| StoreError::poisoned())
    }
}

// Row decoding

fn decode<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Serialization(format!("column {column}: {e}")))
}

fn count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn event_type_from_row(row: &PgRow) -> Result<EventType, StoreError> {
    Ok(EventType {
        id: EventTypeId::from_uuid(decode(row, "id")?),
        name: decode(row, "name")?,
        version: count(decode(row, "version")?),
        webhook_enabled: decode(row, "webhook_enabled")?,
        description: decode(row, "description")?,
        created_at: decode(row, "created_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    let status: String = decode(row, "status")?;
    let locked_by: Option<uuid::Uuid> = decode(row, "locked_by")?;
    let causation_id: Option<uuid::Uuid> = decode(row, "causation_id")?;
    Ok(OutboxEvent {
        id: EventId::from_uuid(decode(row, "id")?),
        event_type_id: EventTypeId::from_uuid(decode(row, "event_type_id")?),
        event_version: count(decode(row, "event_version")?),
        aggregate_id: AggregateId::from_uuid(decode(row, "aggregate_id")?),
        payload: decode(row, "payload")?,
        occurred_at: decode(row, "occurred_at")?,
        seq: decode(row, "seq")?,
        status: OutboxStatus::parse(&status)?,
        attempts: count(decode(row, "attempts")?),
        locked_until: decode(row, "locked_until")?,
        locked_by: locked_by.map(WorkerId::from_uuid),
        processed_at: decode(row, "processed_at")?,
        planned_at: decode(row, "planned_at")?,
        last_error: decode(row, "last_error")?,
        correlation_id: CorrelationId::from_uuid(decode(row, "correlation_id")?),
        causation_id: causation_id.map(EventId::from_uuid),
        dedup_key: decode(row, "dedup_key")?,
        created_at: decode(row, "created_at")?,
        updated_at: decode(row, "updated_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, StoreError> {
    let event_types: Vec<uuid::Uuid> = decode(row, "event_types")?;
    let secret: String = decode(row, "secret")?;
    Ok(Subscription {
        id: SubscriptionId::from_uuid(decode(row, "id")?),
        endpoint_url: decode(row, "endpoint_url")?,
        secret: SubscriptionSecret::new(secret),
        event_types: event_types.into_iter().map(EventTypeId::from_uuid).collect(),
        active: decode(row, "active")?,
        description: decode(row, "description")?,
        created_at: decode(row, "created_at")?,
        updated_at: decode(row, "updated_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<WebhookDelivery, StoreError> {
    let status: String = decode(row, "status")?;
    let code: Option<i32> = decode(row, "last_response_code")?;
    Ok(WebhookDelivery {
        id: DeliveryId::from_uuid(decode(row, "id")?),
        outbox_event_id: EventId::from_uuid(decode(row, "outbox_event_id")?),
        subscription_id: SubscriptionId::from_uuid(decode(row, "subscription_id")?),
        event_type_id: EventTypeId::from_uuid(decode(row, "event_type_id")?),
        status: DeliveryStatus::parse(&status)?,
        attempts: count(decode(row, "attempts")?),
        next_attempt_at: decode(row, "next_attempt_at")?,
        last_response_code: code.and_then(|c| u16::try_from(c).ok()),
        last_error: decode(row, "last_error")?,
        delivered_at: decode(row, "delivered_at")?,
        created_at: decode(row, "created_at")?,
        updated_at: decode(row, "updated_at")?,
    })
}

fn decode_all<T>(rows: &[PgRow], f: fn(&PgRow) -> Result<T, StoreError>) -> Result<Vec<T>, StoreError> {
    rows.iter().map(f).collect()
}

fn uuids<I, T>(ids: I) -> Vec<uuid::Uuid>
where
    I: IntoIterator<Item = T>,
    T: Into<uuid::Uuid>,
{
    ids.into_iter().map(Into::into).collect()
}

fn seconds(d: std::time::Duration) -> f64 {
    d.as_secs_f64()
}

const EVENT_COLUMNS: &str = "id, event_type_id, event_version, aggregate_id, payload, occurred_at, seq, \
     status, attempts, locked_until, locked_by, processed_at, planned_at, last_error, correlation_id, \
     causation_id, dedup_key, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, outbox_event_id, subscription_id, event_type_id, status, attempts, \
     next_attempt_at, last_response_code, last_error, delivered_at, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, endpoint_url, secret, event_types, active, description, created_at, updated_at";
