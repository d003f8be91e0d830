//! Domain events and the outbox-bound envelope.
//!
//! Aggregates emit typed events implementing [`Event`]. The unit-of-work wraps
//! them into [`EventEnvelope`]s (event id, correlation, dedup key, JSON payload)
//! and buffers them in an [`EventCollector`] until the business transaction
//! commits.

pub mod collector;
pub mod definition;
pub mod envelope;
pub mod event;

pub use collector::EventCollector;
pub use definition::EventTypeDefinition;
pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::Event;
