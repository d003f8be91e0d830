use serde::{Deserialize, Serialize};

/// Static description of an event kind, as published by a producing module.
///
/// The outbox registry persists these; `version` may only move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeDefinition {
    pub name: String,
    pub version: u32,
    pub webhook_enabled: bool,
    pub description: String,
}

impl EventTypeDefinition {
    pub fn new(name: impl Into<String>, version: u32, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            webhook_enabled: true,
            description: description.into(),
        }
    }

    /// Keep the type in the catalog but never fan it out to webhooks.
    pub fn internal(mut self) -> Self {
        self.webhook_enabled = false;
        self
    }
}
