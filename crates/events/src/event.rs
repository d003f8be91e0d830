use chrono::{DateTime, Utc};
use serde::Serialize;

/// A domain event raised by an aggregate.
///
/// Events are facts: immutable, versioned, and serializable into the JSON
/// payload that subscribers receive.
pub trait Event: Clone + core::fmt::Debug + Serialize + Send + Sync + 'static {
    /// Dotted event type name (e.g. "batch.created"). Must exist in the
    /// event type registry for the outbox insert to succeed.
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
