//! Operator actions: retry one event, replay a window to a subscription,
//! and read counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use forgemes_observability::{DispatcherMetrics, MetricsSnapshot};
use thiserror::Error;
use tracing::info;

use forgemes_core::{EventId, SubscriptionId};

use crate::error::StoreError;
use crate::model::{OutboxStats, OutboxStatus, ReplayReport, RetryOutcome, RetryReport};
use crate::store::{DeliveryStore, OutboxStore, Stores, SubscriptionStore};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("event {event_id} is {status:?} with no dead deliveries; nothing to retry")]
    NotEligible { event_id: EventId, status: OutboxStatus },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AdminError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AdminError::NotFound(what),
            other => AdminError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct OutboxAdmin {
    outbox: Arc<dyn OutboxStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
    metrics: Arc<DispatcherMetrics>,
}

impl OutboxAdmin {
    pub fn new(stores: &Stores, metrics: Arc<DispatcherMetrics>) -> Self {
        Self {
            outbox: stores.outbox.clone(),
            subscriptions: stores.subscriptions.clone(),
            deliveries: stores.deliveries.clone(),
            metrics,
        }
    }

    /// Put a FAILED event, or one with DEAD deliveries, back in the queue.
    /// Only the DEAD deliveries are attempted again.
    pub async fn retry(&self, event_id: EventId) -> Result<RetryReport, AdminError> {
        match self.outbox.retry_event(event_id, Utc::now()).await? {
            RetryOutcome::Reset(report) => {
                info!(
                    %event_id,
                    reset_deliveries = report.reset_deliveries,
                    "event queued for retry"
                );
                Ok(report)
            }
            RetryOutcome::NotEligible(status) => Err(AdminError::NotEligible { event_id, status }),
        }
    }

    /// Deliver DONE events that occurred in `[since, until)` to one
    /// subscription again.
    pub async fn replay(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<ReplayReport, AdminError> {
        if since >= until {
            return Err(AdminError::Validation("`since` must be before `until`".to_string()));
        }
        let subscription = self
            .subscriptions
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("subscription {subscription_id}")))?;
        if !subscription.active {
            return Err(AdminError::Validation(format!(
                "subscription {subscription_id} is inactive"
            )));
        }

        let report = self.deliveries.replay(subscription_id, since, until, Utc::now()).await?;
        info!(
            %subscription_id,
            %since,
            %until,
            events = report.events,
            deliveries = report.deliveries,
            "replay queued"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> Result<OutboxStats, AdminError> {
        Ok(self.outbox.stats().await?)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
