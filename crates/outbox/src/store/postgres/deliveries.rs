use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Span, instrument};

use forgemes_core::{DeliveryId, EventId, EventTypeId, SubscriptionId};

use super::{DELIVERY_COLUMNS, PgStore, SUBSCRIPTION_COLUMNS, decode, decode_all, delivery_from_row, subscription_from_row, uuids};
use crate::error::{StoreError, map_sqlx_error};
use crate::model::{
    AttemptRecord, OutboxEvent, ReplayReport, Subscription, SubscriptionSecret, SubscriptionUpdate, WebhookDelivery,
};
use crate::store::{DeliveryStore, SubscriptionStore};

#[async_trait]
impl SubscriptionStore for PgStore {
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.id), err)]
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, endpoint_url, secret, event_types, active, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(subscription.id.as_uuid())
        .bind(&subscription.endpoint_url)
        .bind(subscription.secret.expose())
        .bind(uuids(subscription.event_types.iter().copied()))
        .bind(subscription.active)
        .bind(&subscription.description)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("create_subscription", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_subscription", e))?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY created_at, id");
        let rows = sqlx::query(&sql)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("list_subscriptions", e))?;
        decode_all(&rows, subscription_from_row)
    }

    #[instrument(skip(self, update), err)]
    async fn update_subscription(
        &self,
        id: SubscriptionId,
        update: &SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError> {
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET endpoint_url = COALESCE($2, endpoint_url),
                event_types = COALESCE($3, event_types),
                active = COALESCE($4, active),
                description = COALESCE($5, description),
                updated_at = $6
            WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(&update.endpoint_url)
            .bind(update.event_types.as_ref().map(|set| uuids(set.iter().copied())))
            .bind(update.active)
            .bind(&update.description)
            .bind(now)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("update_subscription", e))?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    #[instrument(skip(self, secret), err)]
    async fn set_secret(
        &self,
        id: SubscriptionId,
        secret: &SubscriptionSecret,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError> {
        let sql = format!(
            "UPDATE subscriptions SET secret = $2, updated_at = $3 WHERE id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(secret.expose())
            .bind(now)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("set_secret", e))?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn active_for_event_type(&self, event_type: EventTypeId) -> Result<Vec<Subscription>, StoreError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE active AND $1 = ANY(event_types) ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(event_type.as_uuid())
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("active_for_event_type", e))?;
        decode_all(&rows, subscription_from_row)
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    #[instrument(skip(self, event, subscriptions), fields(event_id = %event.id, subscriptions = subscriptions.len()), err)]
    async fn plan_deliveries(
        &self,
        event: &OutboxEvent,
        subscriptions: &[SubscriptionId],
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_plan_deliveries", e))?;

        let row = sqlx::query("SELECT planned_at FROM outbox_events WHERE id = $1 FOR UPDATE")
            .bind(event.id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("plan_deliveries", e))?
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {}", event.id)))?;
        let planned_at: Option<DateTime<Utc>> = decode(&row, "planned_at")?;

        if planned_at.is_none() {
            let delivery_ids: Vec<uuid::Uuid> = subscriptions.iter().map(|_| uuid::Uuid::now_v7()).collect();
            sqlx::query(
                r#"
                INSERT INTO webhook_deliveries
                    (id, outbox_event_id, subscription_id, event_type_id, status, attempts,
                     next_attempt_at, created_at, updated_at)
                SELECT d.id, $1, d.subscription_id, $2, 'PENDING', 0, $5, $5, $5
                FROM unnest($3::uuid[], $4::uuid[]) AS d(id, subscription_id)
                ON CONFLICT (outbox_event_id, subscription_id) DO NOTHING
                "#,
            )
            .bind(event.id.as_uuid())
            .bind(event.event_type_id.as_uuid())
            .bind(delivery_ids)
            .bind(uuids(subscriptions.iter().copied()))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("plan_deliveries", e))?;

            sqlx::query("UPDATE outbox_events SET planned_at = $2, updated_at = $2 WHERE id = $1")
                .bind(event.id.as_uuid())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("plan_deliveries", e))?;
        }

        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE outbox_event_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(event.id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("plan_deliveries", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_plan_deliveries", e))?;
        decode_all(&rows, delivery_from_row)
    }

    #[instrument(skip(self), err)]
    async fn deliveries_for_event(&self, event: EventId) -> Result<Vec<WebhookDelivery>, StoreError> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE outbox_event_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(event.as_uuid())
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("deliveries_for_event", e))?;
        decode_all(&rows, delivery_from_row)
    }

    #[instrument(skip(self), err)]
    async fn begin_attempt(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<Option<WebhookDelivery>, StoreError> {
        let sql = format!(
            r#"
            UPDATE webhook_deliveries
            SET status = 'IN_FLIGHT', attempts = attempts + 1, updated_at = $2
            WHERE id = $1 AND status IN ('PENDING', 'FAILED') AND next_attempt_at <= $2
            RETURNING {DELIVERY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("begin_attempt", e))?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(status = record.status.as_str()), err)]
    async fn record_attempt(
        &self,
        id: DeliveryId,
        record: &AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = $2,
                last_response_code = $3,
                last_error = $4,
                next_attempt_at = COALESCE($5, next_attempt_at),
                delivered_at = COALESCE($6, delivered_at),
                updated_at = $7
            WHERE id = $1 AND status = 'IN_FLIGHT'
            "#,
        )
        .bind(id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.response_code.map(i32::from))
        .bind(&record.error)
        .bind(record.next_attempt_at)
        .bind(record.delivered_at)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("record_attempt", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn mark_dead(&self, id: DeliveryId, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'DEAD', last_error = $2, updated_at = $3
            WHERE id = $1 AND status IN ('PENDING', 'FAILED')
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("mark_dead", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(reclaimed), err)]
    async fn reclaim_stale_in_flight(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'PENDING', next_attempt_at = $2,
                last_error = 'attempt abandoned by its worker', updated_at = $2
            WHERE status = 'IN_FLIGHT' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale_in_flight", e))?;
        Span::current().record("reclaimed", result.rows_affected());
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn replay(
        &self,
        subscription: SubscriptionId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReplayReport, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_replay", e))?;

        let row = sqlx::query("SELECT event_types FROM subscriptions WHERE id = $1")
            .bind(subscription.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replay", e))?
            .ok_or_else(|| StoreError::NotFound(format!("subscription {subscription}")))?;
        let event_types: Vec<uuid::Uuid> = decode(&row, "event_types")?;

        let targets = sqlx::query(
            r#"
            SELECT e.id, e.event_type_id
            FROM outbox_events e
            JOIN event_types t ON t.id = e.event_type_id
            WHERE e.status = 'DONE'
              AND t.webhook_enabled
              AND e.event_type_id = ANY($1)
              AND e.occurred_at >= $2
              AND e.occurred_at < $3
            ORDER BY e.aggregate_id, e.occurred_at, e.seq
            FOR UPDATE OF e
            "#,
        )
        .bind(event_types)
        .bind(since)
        .bind(until)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replay", e))?;

        if targets.is_empty() {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback_replay", e))?;
            return Ok(ReplayReport::default());
        }

        let mut event_ids = Vec::with_capacity(targets.len());
        let mut type_ids = Vec::with_capacity(targets.len());
        for row in &targets {
            event_ids.push(decode::<uuid::Uuid>(row, "id")?);
            type_ids.push(decode::<uuid::Uuid>(row, "event_type_id")?);
        }
        let delivery_ids: Vec<uuid::Uuid> = event_ids.iter().map(|_| uuid::Uuid::now_v7()).collect();

        // An attempt that is on the wire keeps its row; everything else starts over.
        let deliveries = sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (id, outbox_event_id, subscription_id, event_type_id, status, attempts,
                 next_attempt_at, created_at, updated_at)
            SELECT t.id, t.event_id, $1, t.event_type_id, 'PENDING', 0, $5, $5, $5
            FROM unnest($2::uuid[], $3::uuid[], $4::uuid[]) AS t(id, event_id, event_type_id)
            ON CONFLICT (outbox_event_id, subscription_id) DO UPDATE
                SET status = 'PENDING', attempts = 0, next_attempt_at = $5,
                    last_response_code = NULL, last_error = NULL, delivered_at = NULL, updated_at = $5
                WHERE webhook_deliveries.status <> 'IN_FLIGHT'
            "#,
        )
        .bind(subscription.as_uuid())
        .bind(delivery_ids)
        .bind(&event_ids)
        .bind(type_ids)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replay", e))?
        .rows_affected();

        let events = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PROCESSING', locked_until = $2, locked_by = NULL, processed_at = NULL, updated_at = $2
            WHERE id = ANY($1)
            "#,
        )
        .bind(&event_ids)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replay", e))?
        .rows_affected();

        tx.commit().await.map_err(|e| map_sqlx_error("commit_replay", e))?;
        Ok(ReplayReport { events, deliveries })
    }

    #[instrument(skip(self), err)]
    async fn recent_for_subscription(
        &self,
        subscription: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DELIVERY_COLUMNS}
            FROM webhook_deliveries
            WHERE subscription_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(subscription.as_uuid())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("recent_for_subscription", e))?;
        decode_all(&rows, delivery_from_row)
    }
}
