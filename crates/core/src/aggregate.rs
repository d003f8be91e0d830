//! Aggregate traits shared by the production aggregates.

/// Identity and version of an aggregate root.
pub trait AggregateRoot {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Number of events applied so far. Starts at 0 for a fresh aggregate.
    fn version(&self) -> u64;
}

/// Decide/evolve contract.
///
/// `handle` inspects state and returns the events a command produces, without
/// mutating anything. `apply` evolves state from one event and bumps the
/// version. Neither performs IO; the caller hands the returned events to the
/// unit-of-work so they reach the outbox in the same transaction as the state.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    fn apply(&mut self, event: &Self::Event);

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// `handle` followed by `apply` for every produced event.
    fn execute(&mut self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let events = self.handle(command)?;
        for event in &events {
            self.apply(event);
        }
        Ok(events)
    }
}
