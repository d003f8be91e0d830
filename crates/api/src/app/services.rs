//! Service wiring for the dispatcher process.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use forgemes_observability::DispatcherMetrics;
use forgemes_outbox::{
    Dispatcher, DispatcherConfig, DispatcherHandle, EventTypeRegistry, OutboxAdmin, PgStore, Stores,
    SubscriptionRegistry,
};

/// What the admin handlers need.
#[derive(Clone)]
pub struct AdminServices {
    pub registry: Arc<EventTypeRegistry>,
    pub subscriptions: SubscriptionRegistry,
    pub admin: OutboxAdmin,
}

impl AdminServices {
    pub fn new(stores: &Stores, registry: Arc<EventTypeRegistry>, metrics: Arc<DispatcherMetrics>) -> Self {
        Self {
            subscriptions: SubscriptionRegistry::new(
                stores.subscriptions.clone(),
                stores.deliveries.clone(),
                registry.clone(),
            ),
            admin: OutboxAdmin::new(stores, metrics),
            registry,
        }
    }
}

/// A running dispatcher plus the admin services sharing its stores.
pub struct Runtime {
    pub services: Arc<AdminServices>,
    dispatcher: DispatcherHandle,
    registry_refresh: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Runtime {
    /// Connect to Postgres, install the schema, seed the event catalog and
    /// start the workers.
    pub async fn start(database_url: &str, config: DispatcherConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size())
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;

        let store = PgStore::new(pool);
        store.install_schema().await.context("failed to install outbox schema")?;
        let stores = Stores::postgres(store);

        let registry = Arc::new(EventTypeRegistry::load(stores.event_types.clone()).await?);
        let registered = registry
            .register_all(&forgemes_production::event_catalog())
            .await
            .context("failed to register the event catalog")?;
        info!(event_types = registered.len(), "event catalog registered");

        let metrics = Arc::new(DispatcherMetrics::new());
        let cancel = CancellationToken::new();
        let registry_refresh = registry
            .clone()
            .spawn_refresh(config.registry_refresh, cancel.child_token());

        let dispatcher = Arc::new(
            Dispatcher::new(config, &stores, registry.clone(), metrics.clone())
                .context("failed to build the webhook client")?,
        );
        let dispatcher = dispatcher.spawn(cancel.child_token());

        Ok(Self {
            services: Arc::new(AdminServices::new(&stores, registry, metrics)),
            dispatcher,
            registry_refresh,
            cancel,
        })
    }

    /// Stop claiming, let in-flight work finish within the configured
    /// deadline, then stop the registry refresher.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        self.cancel.cancel();
        let _ = self.registry_refresh.await;
        info!("dispatcher stopped");
    }
}
