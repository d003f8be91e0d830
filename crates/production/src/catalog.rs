use forgemes_events::EventTypeDefinition;

/// Every event type the production module can emit.
///
/// Registered at start-up so producers can insert into the outbox and the
/// planner can fan the events out.
pub fn event_catalog() -> Vec<EventTypeDefinition> {
    vec![
        EventTypeDefinition::new("work_center.created", 1, "A work center was registered"),
        EventTypeDefinition::new("work_center.deactivated", 1, "A work center was taken out of service"),
        EventTypeDefinition::new("batch.created", 1, "A production batch was opened"),
        EventTypeDefinition::new("batch.closed", 1, "A production batch was closed with its produced quantity"),
        EventTypeDefinition::new("product.created", 1, "A serialized unit was produced"),
        EventTypeDefinition::new("product.aggregated", 1, "A unit was packed into a parent unit"),
    ]
}
