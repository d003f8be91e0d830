//! In-process cache of the `event_types` table.
//!
//! Loaded once at start-up and refreshed on a timer; lookups that miss go to
//! the store once before giving up, so a type registered by another process
//! becomes visible without waiting for the next tick.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use forgemes_core::EventTypeId;
use forgemes_events::EventTypeDefinition;

use crate::error::StoreError;
use crate::model::EventType;
use crate::store::EventTypeStore;

#[derive(Debug, Default)]
struct Catalog {
    by_name: HashMap<String, EventType>,
    names: HashMap<EventTypeId, String>,
}

impl Catalog {
    fn insert(&mut self, event_type: EventType) {
        self.names.insert(event_type.id, event_type.name.clone());
        self.by_name.insert(event_type.name.clone(), event_type);
    }
}

pub struct EventTypeRegistry {
    store: Arc<dyn EventTypeStore>,
    catalog: RwLock<Catalog>,
}

impl EventTypeRegistry {
    /// An empty registry. Call [`refresh`](Self::refresh) or use
    /// [`load`](Self::load) to populate it.
    pub fn new(store: Arc<dyn EventTypeStore>) -> Self {
        Self {
            store,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    pub async fn load(store: Arc<dyn EventTypeStore>) -> Result<Self, StoreError> {
        let registry = Self::new(store);
        registry.refresh().await?;
        Ok(registry)
    }

    /// Replace the cache with the current table. Returns the number of types.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let types = self.store.list_event_types().await?;
        let mut fresh = Catalog::default();
        for event_type in types {
            fresh.insert(event_type);
        }
        let count = fresh.by_name.len();
        *self.catalog.write().map_err(|_| StoreError::poisoned())? = fresh;
        debug!(count, "event type registry refreshed");
        Ok(count)
    }

    /// Register (or bump) a type in the store and cache the result.
    pub async fn register(&self, definition: &EventTypeDefinition) -> Result<EventType, StoreError> {
        let event_type = self.store.register_event_type(definition).await?;
        self.catalog
            .write()
            .map_err(|_| StoreError::poisoned())?
            .insert(event_type.clone());
        Ok(event_type)
    }

    pub async fn register_all(&self, definitions: &[EventTypeDefinition]) -> Result<Vec<EventType>, StoreError> {
        let mut registered = Vec::with_capacity(definitions.len());
        for definition in definitions {
            registered.push(self.register(definition).await?);
        }
        info!(count = registered.len(), "event catalog registered");
        Ok(registered)
    }

    /// Cached lookup only.
    pub fn by_name(&self, name: &str) -> Option<EventType> {
        self.catalog.read().ok()?.by_name.get(name).cloned()
    }

    /// Cached lookup only.
    pub fn by_id(&self, id: EventTypeId) -> Option<EventType> {
        let catalog = self.catalog.read().ok()?;
        let name = catalog.names.get(&id)?;
        catalog.by_name.get(name).cloned()
    }

    pub async fn resolve_name(&self, name: &str) -> Result<Option<EventType>, StoreError> {
        if let Some(hit) = self.by_name(name) {
            return Ok(Some(hit));
        }
        self.refresh().await?;
        Ok(self.by_name(name))
    }

    pub async fn resolve_id(&self, id: EventTypeId) -> Result<Option<EventType>, StoreError> {
        if let Some(hit) = self.by_id(id) {
            return Ok(Some(hit));
        }
        self.refresh().await?;
        Ok(self.by_id(id))
    }

    pub fn len(&self) -> usize {
        self.catalog.read().map(|c| c.by_name.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refresh every `every` until `cancel` fires. Failures are logged and
    /// the previous cache is kept.
    pub fn spawn_refresh(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately and the registry is already loaded
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.refresh().await {
                            warn!(%error, "event type registry refresh failed");
                        }
                    }
                }
            }
        })
    }
}
