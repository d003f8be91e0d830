//! Identifiers, domain errors and aggregate traits shared by the ForgeMES crates.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot};
pub use error::{DomainError, DomainResult};
pub use id::{
    AggregateId, CorrelationId, DeliveryId, EventId, EventTypeId, SubscriptionId, WorkerId,
};
