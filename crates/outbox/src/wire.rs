//! Webhook wire format.
//!
//! The body is built from the stored outbox row only, so every retry of an
//! event sends byte-identical JSON and therefore the same signature.

use chrono::SecondsFormat;
use serde::Serialize;

use forgemes_core::{AggregateId, CorrelationId, EventId};

use crate::model::{EventType, OutboxEvent};

pub const HEADER_EVENT_ID: &str = "X-Event-Id";
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";
pub const HEADER_EVENT_VERSION: &str = "X-Event-Version";
pub const HEADER_DELIVERY_ID: &str = "X-Delivery-Id";
pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const USER_AGENT: &str = concat!("forgemes-webhooks/", env!("CARGO_PKG_VERSION"));

/// Field order is part of the format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookBody<'a> {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub version: u32,
    pub occurred_at: String,
    pub aggregate_id: AggregateId,
    pub payload: &'a serde_json::Value,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
}

impl<'a> WebhookBody<'a> {
    pub fn new(event: &'a OutboxEvent, event_type: &'a EventType) -> Self {
        Self {
            id: event.id,
            event_type: &event_type.name,
            version: event.event_version,
            occurred_at: event.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            aggregate_id: event.aggregate_id,
            payload: &event.payload,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutboxStatus;
    use chrono::{TimeZone, Utc};
    use forgemes_core::EventTypeId;

    fn fixture() -> (OutboxEvent, EventType) {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let ty = EventType {
            id: EventTypeId::new(),
            name: "batch.closed".into(),
            version: 1,
            webhook_enabled: true,
            description: String::new(),
            created_at: at,
        };
        let ev = OutboxEvent {
            id: EventId::new(),
            event_type_id: ty.id,
            event_version: 1,
            aggregate_id: AggregateId::new(),
            payload: serde_json::json!({"z": 1, "batch": "B-1"}),
            occurred_at: at,
            seq: 0,
            status: OutboxStatus::Processing,
            attempts: 1,
            locked_until: None,
            locked_by: None,
            processed_at: None,
            planned_at: None,
            last_error: None,
            correlation_id: CorrelationId::new(),
            causation_id: None,
            dedup_key: None,
            created_at: at,
            updated_at: at,
        };
        (ev, ty)
    }

    #[test]
    fn body_has_fixed_field_order() {
        let (ev, ty) = fixture();
        let text = String::from_utf8(WebhookBody::new(&ev, &ty).to_bytes().unwrap()).unwrap();

        let keys = ["\"id\"", "\"type\"", "\"version\"", "\"occurred_at\"", "\"aggregate_id\"", "\"payload\"", "\"correlation_id\"", "\"causation_id\""];
        let positions: Vec<usize> = keys.iter().map(|k| text.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
        assert!(text.contains("\"type\":\"batch.closed\""));
        assert!(text.contains("\"occurred_at\":\"2024-03-01T12:00:00.000000Z\""));
        assert!(text.contains("\"causation_id\":null"));
    }

    #[test]
    fn body_is_stable_across_builds() {
        let (ev, ty) = fixture();
        let a = WebhookBody::new(&ev, &ty).to_bytes().unwrap();
        let b = WebhookBody::new(&ev, &ty).to_bytes().unwrap();
        assert_eq!(a, b);
    }
}
