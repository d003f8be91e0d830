use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use forgemes_core::{AggregateId, CorrelationId, EventId};

use crate::event::Event;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("event payload could not be serialized: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("dedup key cannot be blank")]
    BlankDedupKey,
}

/// Outbox-bound wrapper around one domain event.
///
/// Carries everything the outbox row needs: a time-ordered event id, the
/// ordering key (`aggregate_id`), the JSON payload, tracing metadata and an
/// optional producer-chosen dedup key.
///
/// `occurred_at` is truncated to microseconds so the value a subscriber sees
/// is identical to what the database stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: String,
    version: u32,
    aggregate_id: AggregateId,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    correlation_id: CorrelationId,
    causation_id: Option<EventId>,
    dedup_key: Option<String>,
}

impl EventEnvelope {
    /// Wrap a typed event, serializing it to its JSON payload.
    pub fn from_typed<E: Event>(aggregate_id: AggregateId, event: &E) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(
            event.event_type(),
            event.version(),
            aggregate_id,
            payload,
            event.occurred_at(),
        ))
    }

    /// Build an envelope from an already-serialized payload.
    pub fn new(
        event_type: impl Into<String>,
        version: u32,
        aggregate_id: AggregateId,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            version,
            aggregate_id,
            payload,
            occurred_at: occurred_at.trunc_subsecs(6),
            correlation_id: CorrelationId::new(),
            causation_id: None,
            dedup_key: None,
        }
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation(mut self, causation_id: EventId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Attach a producer-chosen idempotency key. A retried producer that
    /// reuses the key will not create a second outbox row.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Result<Self, EnvelopeError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(EnvelopeError::BlankDedupKey);
        }
        self.dedup_key = Some(key);
        Ok(self)
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<EventId> {
        self.causation_id
    }

    pub fn dedup_key(&self) -> Option<&str> {
        self.dedup_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    struct Probe {
        lot: String,
        at: DateTime<Utc>,
    }

    impl Event for Probe {
        fn event_type(&self) -> &'static str {
            "probe.happened"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn from_typed_copies_metadata_and_truncates_time() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let agg = AggregateId::new();
        let env = EventEnvelope::from_typed(agg, &Probe { lot: "L-1".into(), at }).unwrap();

        assert_eq!(env.event_type(), "probe.happened");
        assert_eq!(env.version(), 2);
        assert_eq!(env.aggregate_id(), agg);
        assert_eq!(env.occurred_at().timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(env.payload()["lot"], "L-1");
        assert!(env.causation_id().is_none());
    }

    #[test]
    fn blank_dedup_key_is_rejected() {
        let env = EventEnvelope::new("probe.happened", 1, AggregateId::new(), serde_json::json!({}), Utc::now());
        assert!(matches!(env.with_dedup_key("  "), Err(EnvelopeError::BlankDedupKey)));
    }

    #[test]
    fn causation_links_to_parent_event() {
        let parent = EventId::new();
        let env = EventEnvelope::new("probe.happened", 1, AggregateId::new(), serde_json::json!({}), Utc::now())
            .with_causation(parent);
        assert_eq!(env.causation_id(), Some(parent));
    }
}
