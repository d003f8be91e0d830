//! Transactional outbox and webhook delivery.
//!
//! Producers write outbox rows in the same transaction as their business
//! rows through a [`unit_of_work::UnitOfWork`]. A [`dispatcher::Dispatcher`]
//! claims those rows under a lease, expands each into one delivery per
//! matching subscription ([`planner`]) and POSTs signed JSON bodies with
//! bounded retries ([`executor`]).
//!
//! Storage sits behind the traits in [`store`]; Postgres is the production
//! backend and an in-memory store with the same semantics backs tests and
//! local runs.

pub mod admin;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod model;
pub mod planner;
pub mod registry;
pub mod signing;
pub mod store;
pub mod subscriptions;
pub mod unit_of_work;
pub mod wire;

pub use admin::{AdminError, OutboxAdmin};
pub use config::{ConfigError, DispatcherConfig};
pub use dispatcher::{BatchReport, Dispatcher, DispatcherHandle};
pub use error::StoreError;
pub use executor::{AttemptOutcome, DeliveryExecutor};
pub use model::{
    DeliveryStatus, EventType, OutboxEvent, OutboxStats, OutboxStatus, ReplayReport, RetryReport, Subscription,
    SubscriptionSecret, WebhookDelivery,
};
pub use planner::{DeliveryPlanner, Plan, PlanError};
pub use registry::EventTypeRegistry;
pub use store::{InMemoryStore, PgStore, Stores};
pub use subscriptions::{NewSubscription, SubscriptionError, SubscriptionPatch, SubscriptionRegistry};
pub use unit_of_work::{CommitError, CommitReport, InMemoryUnitOfWork, PgUnitOfWork, UnitOfWork};
