use forgemes_core::CorrelationId;

use crate::envelope::EventEnvelope;

/// Per-transaction buffer of events waiting for the outbox insert.
///
/// The unit-of-work owns one collector. It is drained only when the
/// transaction commits; a rollback simply drops it.
#[derive(Debug, Default)]
pub struct EventCollector {
    correlation_id: Option<CorrelationId>,
    events: Vec<EventEnvelope>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event collected afterwards is stamped with this correlation id.
    pub fn with_correlation(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            events: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn collect(&mut self, envelope: EventEnvelope) {
        let envelope = match self.correlation_id {
            Some(correlation) => envelope.with_correlation(correlation),
            None => envelope,
        };
        self.events.push(envelope);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// Take the buffered events ordered by `occurred_at`, ties kept in
    /// insertion order. The outbox preserves that order for ties through its
    /// insertion sequence, whatever the event ids.
    pub fn drain_ordered(&mut self) -> Vec<EventEnvelope> {
        let mut events = std::mem::take(&mut self.events);
        events.sort_by_key(|e| e.occurred_at());
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use forgemes_core::AggregateId;
    use proptest::prelude::*;

    fn env_at(offset_ms: i64) -> EventEnvelope {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        EventEnvelope::new(
            "probe.happened",
            1,
            AggregateId::new(),
            serde_json::json!({ "offset": offset_ms }),
            base + Duration::milliseconds(offset_ms),
        )
    }

    #[test]
    fn collector_applies_default_correlation() {
        let correlation = CorrelationId::new();
        let mut collector = EventCollector::with_correlation(correlation);
        collector.collect(env_at(0));
        collector.collect(env_at(1));
        assert!(collector.events().iter().all(|e| e.correlation_id() == correlation));
    }

    #[test]
    fn drain_empties_the_buffer() {
        let mut collector = EventCollector::new();
        collector.collect(env_at(5));
        assert_eq!(collector.drain_ordered().len(), 1);
        assert!(collector.is_empty());
    }

    proptest! {
        #[test]
        fn drain_is_sorted_and_stable(offsets in proptest::collection::vec(0i64..20, 0..40)) {
            let mut collector = EventCollector::new();
            let mut ids = Vec::new();
            for o in &offsets {
                let env = env_at(*o);
                ids.push((*o, env.event_id()));
                collector.collect(env);
            }

            let drained = collector.drain_ordered();
            prop_assert_eq!(drained.len(), offsets.len());

            // stable sort of the input by offset gives the expected order
            ids.sort_by_key(|(o, _)| *o);
            let got: Vec<_> = drained.iter().map(|e| e.event_id()).collect();
            let want: Vec<_> = ids.iter().map(|(_, id)| *id).collect();
            prop_assert_eq!(got, want);
        }
    }
}
