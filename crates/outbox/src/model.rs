//! Rows of the four outbox tables and the values passed between stores,
//! planner, executor and dispatcher.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use forgemes_core::{AggregateId, CorrelationId, DeliveryId, EventId, EventTypeId, SubscriptionId, WorkerId};

use crate::error::StoreError;

/// A registered kind of event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: EventTypeId,
    pub name: String,
    pub version: u32,
    pub webhook_enabled: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Done => "DONE",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "DONE" => Ok(OutboxStatus::Done),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::Serialization(format!("unknown outbox status {other:?}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Done | OutboxStatus::Failed)
    }
}

/// One outbox row.
///
/// `attempts` counts claims, not HTTP calls. `locked_until` is the lease
/// while a worker holds the row and the wake-up time while the row waits
/// for a delivery retry. `planned_at` is set once the deliveries for the
/// event exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub event_type_id: EventTypeId,
    pub event_version: u32,
    pub aggregate_id: AggregateId,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    /// Insertion order, assigned by the store. Breaks `occurred_at` ties.
    pub seq: i64,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    pub processed_at: Option<DateTime<Utc>>,
    pub planned_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Position of the event within its aggregate.
    pub fn order_key(&self) -> (AggregateId, DateTime<Utc>, i64) {
        (self.aggregate_id, self.occurred_at, self.seq)
    }
}

/// Shared secret used to sign webhook bodies. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SubscriptionSecret(String);

impl SubscriptionSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// 32 random bytes, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl core::fmt::Debug for SubscriptionSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SubscriptionSecret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub endpoint_url: String,
    #[serde(skip_serializing)]
    pub secret: SubscriptionSecret,
    pub event_types: BTreeSet<EventTypeId>,
    pub active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn matches(&self, event_type: EventTypeId) -> bool {
        self.active && self.event_types.contains(&event_type)
    }
}

/// Partial update of a subscription. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub endpoint_url: Option<String>,
    pub event_types: Option<BTreeSet<EventTypeId>>,
    pub active: Option<bool>,
    pub description: Option<String>,
}

/// Delivery status.
///
/// The dispatcher writes PENDING, IN_FLIGHT, SUCCEEDED and DEAD. FAILED is
/// accepted for rows written by older tooling and is handled like PENDING.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::InFlight => "IN_FLIGHT",
            DeliveryStatus::Succeeded => "SUCCEEDED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Dead => "DEAD",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "IN_FLIGHT" => Ok(DeliveryStatus::InFlight),
            "SUCCEEDED" => Ok(DeliveryStatus::Succeeded),
            "FAILED" => Ok(DeliveryStatus::Failed),
            "DEAD" => Ok(DeliveryStatus::Dead),
            other => Err(StoreError::Serialization(format!("unknown delivery status {other:?}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Succeeded | DeliveryStatus::Dead)
    }

    /// Waiting for its next attempt.
    pub fn is_waiting(self) -> bool {
        matches!(self, DeliveryStatus::Pending | DeliveryStatus::Failed)
    }
}

/// One `(event, subscription)` delivery and the state of its latest attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub outbox_event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub event_type_id: EventTypeId,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_response_code: Option<u16>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn pending(event: &OutboxEvent, subscription_id: SubscriptionId, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            outbox_event_id: event.id,
            subscription_id,
            event_type_id: event.event_type_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_response_code: None,
            last_error: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.next_attempt_at <= now
    }
}

/// Result of one HTTP attempt, written back onto an IN_FLIGHT delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub status: DeliveryStatus,
    pub response_code: Option<u16>,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    pub fn succeeded(code: u16, now: DateTime<Utc>) -> Self {
        Self {
            status: DeliveryStatus::Succeeded,
            response_code: Some(code),
            error: None,
            next_attempt_at: None,
            delivered_at: Some(now),
        }
    }

    pub fn retry(code: Option<u16>, error: String, next_attempt_at: DateTime<Utc>) -> Self {
        Self {
            status: DeliveryStatus::Pending,
            response_code: code,
            error: Some(error),
            next_attempt_at: Some(next_attempt_at),
            delivered_at: None,
        }
    }

    pub fn dead(code: Option<u16>, error: String) -> Self {
        Self {
            status: DeliveryStatus::Dead,
            response_code: code,
            error: Some(error),
            next_attempt_at: None,
            delivered_at: None,
        }
    }
}

/// What the dispatcher decided for a claimed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every delivery is terminal.
    Done,
    /// Stay PROCESSING; claimable again at `until`.
    Defer { until: DateTime<Utc>, error: Option<String> },
    /// The event could not be planned.
    Failed { error: String },
    /// Not processed in this batch; back to PENDING.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub event_id: EventId,
    pub reset_deliveries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Reset(RetryReport),
    /// Neither FAILED nor carrying DEAD deliveries.
    NotEligible(OutboxStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub events: u64,
    pub deliveries: u64,
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub events_pending: u64,
    pub events_processing: u64,
    pub events_done: u64,
    pub events_failed: u64,
    pub deliveries_pending: u64,
    pub deliveries_in_flight: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
    pub deliveries_dead: u64,
}

impl OutboxStats {
    pub fn add_event(&mut self, status: OutboxStatus, n: u64) {
        let slot = match status {
            OutboxStatus::Pending => &mut self.events_pending,
            OutboxStatus::Processing => &mut self.events_processing,
            OutboxStatus::Done => &mut self.events_done,
            OutboxStatus::Failed => &mut self.events_failed,
        };
        *slot += n;
    }

    pub fn add_delivery(&mut self, status: DeliveryStatus, n: u64) {
        let slot = match status {
            DeliveryStatus::Pending => &mut self.deliveries_pending,
            DeliveryStatus::InFlight => &mut self.deliveries_in_flight,
            DeliveryStatus::Succeeded => &mut self.deliveries_succeeded,
            DeliveryStatus::Failed => &mut self.deliveries_failed,
            DeliveryStatus::Dead => &mut self.deliveries_dead,
        };
        *slot += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SubscriptionSecret::new("hunter2-hunter2-hunter2");
        assert_eq!(format!("{secret:?}"), "SubscriptionSecret(***)");
    }

    #[test]
    fn generated_secrets_are_32_bytes() {
        let a = SubscriptionSecret::generate();
        let b = SubscriptionSecret::generate();
        assert_eq!(a.expose().len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn failed_deliveries_wait_like_pending_ones() {
        assert!(DeliveryStatus::Failed.is_waiting());
        assert!(!DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::InFlight.is_waiting());
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [OutboxStatus::Pending, OutboxStatus::Processing, OutboxStatus::Done, OutboxStatus::Failed] {
            assert_eq!(OutboxStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(DeliveryStatus::parse("LOST").is_err());
    }
}
