use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::{Span, instrument};

use forgemes_core::{AggregateId, EventId, WorkerId};
use forgemes_events::EventTypeDefinition;

use super::{
    AGGREGATE_LOCK_NAMESPACE, EVENT_COLUMNS, PgStore, decode, decode_all, event_from_row, event_type_from_row,
    seconds, uuids,
};
use crate::error::{StoreError, map_sqlx_error};
use crate::model::{DeliveryStatus, EventType, OutboxEvent, OutboxStats, OutboxStatus, Resolution, RetryOutcome, RetryReport};
use crate::store::{EventTypeStore, OutboxStore};

#[async_trait]
impl EventTypeStore for PgStore {
    #[instrument(skip(self), err)]
    async fn list_event_types(&self) -> Result<Vec<EventType>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, version, webhook_enabled, description, created_at
            FROM event_types
            ORDER BY name
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_event_types", e))?;
        decode_all(&rows, event_type_from_row)
    }

    #[instrument(skip(self, definition), fields(name = %definition.name, version = definition.version), err)]
    async fn register_event_type(&self, definition: &EventTypeDefinition) -> Result<EventType, StoreError> {
        if definition.version == 0 {
            return Err(StoreError::Validation("event type version must be >= 1".to_string()));
        }

        // Only the version moves after the first registration, and only forward.
        let row = sqlx::query(
            r#"
            INSERT INTO event_types (id, name, version, webhook_enabled, description)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE
                SET version = EXCLUDED.version, updated_at = now()
                WHERE event_types.version <= EXCLUDED.version
            RETURNING id, name, version, webhook_enabled, description, created_at
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&definition.name)
        .bind(i32::try_from(definition.version).unwrap_or(i32::MAX))
        .bind(definition.webhook_enabled)
        .bind(&definition.description)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("register_event_type", e))?;

        match row {
            Some(row) => event_type_from_row(&row),
            None => Err(StoreError::Validation(format!(
                "event type {} is registered with a version above {}",
                definition.name, definition.version
            ))),
        }
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    #[instrument(skip(self), fields(claimed), err)]
    async fn claim(&self, worker: WorkerId, limit: usize, lease: Duration) -> Result<Vec<OutboxEvent>, StoreError> {
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT e.id
                FROM outbox_events e
                WHERE (e.status = 'PENDING'
                       OR (e.status = 'PROCESSING' AND (e.locked_until IS NULL OR e.locked_until <= now())))
                  AND NOT EXISTS (
                      SELECT 1
                      FROM outbox_events b
                      WHERE b.aggregate_id = e.aggregate_id
                        AND b.status = 'PROCESSING'
                        AND b.locked_until > now()
                        AND (b.occurred_at, b.seq) < (e.occurred_at, e.seq)
                  )
                ORDER BY e.aggregate_id, e.occurred_at, e.seq
                LIMIT $1
                FOR UPDATE OF e SKIP LOCKED
            )
            UPDATE outbox_events
            SET status = 'PROCESSING',
                locked_until = now() + make_interval(secs => $2),
                locked_by = $3,
                attempts = attempts + 1,
                updated_at = now()
            WHERE id IN (SELECT id FROM candidates)
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(seconds(lease))
            .bind(worker.as_uuid())
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        // RETURNING gives no ordering guarantee
        let mut claimed = decode_all(&rows, event_from_row)?;
        claimed.sort_by_key(OutboxEvent::order_key);
        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, ids), fields(rows = ids.len()), err)]
    async fn extend_lease(&self, worker: WorkerId, ids: &[EventId], lease: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET locked_until = now() + make_interval(secs => $3), updated_at = now()
            WHERE id = ANY($2) AND status = 'PROCESSING' AND locked_by = $1
            "#,
        )
        .bind(worker.as_uuid())
        .bind(uuids(ids.iter().copied()))
        .bind(seconds(lease))
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("extend_lease", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, resolutions), fields(rows = resolutions.len(), applied), err)]
    async fn finalize(&self, worker: WorkerId, resolutions: &[(EventId, Resolution)]) -> Result<u64, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_finalize", e))?;

        let mut applied = 0;
        for (id, resolution) in resolutions {
            applied += apply_resolution(&mut tx, worker, *id, resolution).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_finalize", e))?;
        Span::current().record("applied", applied);
        Ok(applied)
    }

    #[instrument(skip(self, aggregates), fields(requested = aggregates.len(), acquired), err)]
    async fn lock_aggregates(
        &self,
        worker: WorkerId,
        aggregates: &[AggregateId],
        _lease: Duration,
    ) -> Result<Vec<AggregateId>, StoreError> {
        let session = self.lock_session(worker).await?;
        let mut conn = session.lock().await;

        let mut acquired = Vec::with_capacity(aggregates.len());
        for aggregate in aggregates {
            let row = sqlx::query("SELECT pg_try_advisory_lock($1, hashtext($2)) AS locked")
                .bind(AGGREGATE_LOCK_NAMESPACE)
                .bind(aggregate.to_string())
                .fetch_one(&mut **conn)
                .await;
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    // a broken session has lost its locks anyway; open a new one next time
                    drop(conn);
                    self.drop_lock_session(worker);
                    return Err(map_sqlx_error("lock_aggregates", e));
                }
            };
            if decode::<bool>(&row, "locked")? {
                acquired.push(*aggregate);
            }
        }
        Span::current().record("acquired", acquired.len());
        Ok(acquired)
    }

    #[instrument(skip(self), err)]
    async fn release_aggregate_locks(&self, worker: WorkerId) -> Result<(), StoreError> {
        let session = self.sessions()?.get(&worker).cloned();
        let Some(session) = session else {
            return Ok(());
        };
        let mut conn = session.lock().await;
        let result = sqlx::query("SELECT pg_advisory_unlock_all()")
            .execute(&mut **conn)
            .await;
        if let Err(e) = result {
            drop(conn);
            self.drop_lock_session(worker);
            return Err(map_sqlx_error("release_aggregate_locks", e));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn aggregate_heads(&self, aggregate: AggregateId, limit: usize) -> Result<Vec<EventId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM outbox_events
            WHERE aggregate_id = $1 AND status IN ('PENDING', 'PROCESSING')
            ORDER BY occurred_at, seq
            LIMIT $2
            "#,
        )
        .bind(aggregate.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("aggregate_heads", e))?;

        rows.iter()
            .map(|row| decode::<uuid::Uuid>(row, "id").map(EventId::from_uuid))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn get_event(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_event", e))?;
        row.as_ref().map(event_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn retry_event(&self, id: EventId, now: DateTime<Utc>) -> Result<RetryOutcome, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_retry_event", e))?;

        let row = sqlx::query("SELECT status FROM outbox_events WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("retry_event", e))?
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {id}")))?;
        let status = OutboxStatus::parse(&decode::<String>(&row, "status")?)?;

        let reset = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'PENDING', attempts = 0, next_attempt_at = $2, updated_at = $2
            WHERE outbox_event_id = $1 AND status = 'DEAD'
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retry_event", e))?
        .rows_affected();

        if status != OutboxStatus::Failed && reset == 0 {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback_retry_event", e))?;
            return Ok(RetryOutcome::NotEligible(status));
        }

        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', locked_until = NULL, locked_by = NULL,
                processed_at = NULL, last_error = NULL, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retry_event", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_retry_event", e))?;
        Ok(RetryOutcome::Reset(RetryReport {
            event_id: id,
            reset_deliveries: reset,
        }))
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let mut stats = OutboxStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbox_events GROUP BY status")
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;
        for row in &rows {
            let status = OutboxStatus::parse(&decode::<String>(row, "status")?)?;
            stats.add_event(status, non_negative(decode(row, "n")?));
        }

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM webhook_deliveries GROUP BY status")
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;
        for row in &rows {
            let status = DeliveryStatus::parse(&decode::<String>(row, "status")?)?;
            stats.add_delivery(status, non_negative(decode(row, "n")?));
        }
        Ok(stats)
    }
}

fn non_negative(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// Write one resolution if `worker` still holds the row. Returns 0 or 1.
async fn apply_resolution(
    tx: &mut Transaction<'static, Postgres>,
    worker: WorkerId,
    id: EventId,
    resolution: &Resolution,
) -> Result<u64, StoreError> {
    const HELD: &str = "WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2";

    let sql = match resolution {
        Resolution::Done => format!(
            "UPDATE outbox_events SET status = 'DONE', processed_at = now(), locked_until = NULL, \
             locked_by = NULL, updated_at = now() {HELD}"
        ),
        Resolution::Defer { .. } => format!(
            "UPDATE outbox_events SET locked_until = $3, last_error = COALESCE($4, last_error), \
             updated_at = now() {HELD}"
        ),
        Resolution::Failed { .. } => format!(
            "UPDATE outbox_events SET status = 'FAILED', processed_at = now(), locked_until = NULL, \
             locked_by = NULL, last_error = $3, updated_at = now() {HELD}"
        ),
        Resolution::Release => format!(
            "UPDATE outbox_events SET status = 'PENDING', locked_until = NULL, locked_by = NULL, \
             updated_at = now() {HELD}"
        ),
    };

    let query = sqlx::query(&sql).bind(id.as_uuid()).bind(worker.as_uuid());
    let query = match resolution {
        Resolution::Defer { until, error } => query.bind(*until).bind(error.clone()),
        Resolution::Failed { error } => query.bind(error.clone()),
        Resolution::Done | Resolution::Release => query,
    };
    let result = query
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("finalize", e))?;
    Ok(result.rows_affected())
}
