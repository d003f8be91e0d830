//! Subscription management.
//!
//! Subscriptions name event types by name; they are resolved against the
//! registry and stored by id. Changes take effect at the next planner run;
//! a request already on the wire is never cancelled.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use thiserror::Error;
use tracing::info;

use forgemes_core::{EventTypeId, SubscriptionId};

use crate::error::StoreError;
use crate::model::{Subscription, SubscriptionSecret, SubscriptionUpdate, WebhookDelivery};
use crate::registry::EventTypeRegistry;
use crate::store::{DeliveryStore, SubscriptionStore};

/// Shorter caller-supplied secrets are rejected.
pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("invalid subscription: {0}")]
    Validation(String),

    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default)]
pub struct NewSubscription {
    pub endpoint_url: String,
    pub event_types: Vec<String>,
    /// Generated when absent.
    pub secret: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub endpoint_url: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub active: Option<bool>,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
    registry: Arc<EventTypeRegistry>,
}

impl SubscriptionRegistry {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
        registry: Arc<EventTypeRegistry>,
    ) -> Self {
        Self {
            subscriptions,
            deliveries,
            registry,
        }
    }

    /// Create an active subscription. The secret is returned once, here.
    pub async fn create(
        &self,
        request: NewSubscription,
    ) -> Result<(Subscription, SubscriptionSecret), SubscriptionError> {
        let endpoint_url = validate_endpoint(&request.endpoint_url)?;
        let event_types = self.resolve_types(&request.event_types).await?;
        let secret = secret_or_generate(request.secret)?;

        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            endpoint_url,
            secret: secret.clone(),
            event_types,
            active: true,
            description: request.description,
            created_at: now,
            updated_at: now,
        };
        self.subscriptions.create_subscription(&subscription).await?;
        info!(
            subscription_id = %subscription.id,
            endpoint = %subscription.endpoint_url,
            event_types = subscription.event_types.len(),
            "subscription created"
        );
        Ok((subscription, secret))
    }

    pub async fn list(&self) -> Result<Vec<Subscription>, SubscriptionError> {
        Ok(self.subscriptions.list_subscriptions().await?)
    }

    pub async fn get(&self, id: SubscriptionId) -> Result<Subscription, SubscriptionError> {
        self.subscriptions
            .get_subscription(id)
            .await?
            .ok_or(SubscriptionError::NotFound(id))
    }

    pub async fn update(&self, id: SubscriptionId, patch: SubscriptionPatch) -> Result<Subscription, SubscriptionError> {
        let endpoint_url = patch.endpoint_url.as_deref().map(validate_endpoint).transpose()?;
        let event_types = match &patch.event_types {
            Some(names) => Some(self.resolve_types(names).await?),
            None => None,
        };
        let update = SubscriptionUpdate {
            endpoint_url,
            event_types,
            active: patch.active,
            description: patch.description,
        };

        let updated = self
            .subscriptions
            .update_subscription(id, &update, Utc::now())
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        info!(subscription_id = %id, active = updated.active, "subscription updated");
        Ok(updated)
    }

    pub async fn deactivate(&self, id: SubscriptionId) -> Result<Subscription, SubscriptionError> {
        self.update(
            id,
            SubscriptionPatch {
                active: Some(false),
                ..SubscriptionPatch::default()
            },
        )
        .await
    }

    /// Replace the signing secret. The next attempt of every delivery signs
    /// with the new one.
    pub async fn rotate_secret(
        &self,
        id: SubscriptionId,
        secret: Option<String>,
    ) -> Result<SubscriptionSecret, SubscriptionError> {
        let secret = secret_or_generate(secret)?;
        self.subscriptions
            .set_secret(id, &secret, Utc::now())
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        info!(subscription_id = %id, "subscription secret rotated");
        Ok(secret)
    }

    /// Newest deliveries first.
    pub async fn recent_deliveries(
        &self,
        id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, SubscriptionError> {
        self.get(id).await?;
        Ok(self.deliveries.recent_for_subscription(id, limit).await?)
    }

    async fn resolve_types(&self, names: &[String]) -> Result<BTreeSet<EventTypeId>, SubscriptionError> {
        if names.is_empty() {
            return Err(SubscriptionError::Validation(
                "at least one event type is required".to_string(),
            ));
        }
        let mut ids = BTreeSet::new();
        for name in names {
            let event_type = self
                .registry
                .resolve_name(name)
                .await?
                .ok_or_else(|| SubscriptionError::Validation(format!("unknown event type {name:?}")))?;
            ids.insert(event_type.id);
        }
        Ok(ids)
    }
}

fn validate_endpoint(raw: &str) -> Result<String, SubscriptionError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| SubscriptionError::Validation(format!("endpoint url is invalid: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SubscriptionError::Validation(format!(
            "endpoint url must be http or https, got {:?}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(SubscriptionError::Validation("endpoint url has no host".to_string()));
    }
    Ok(url.to_string())
}

fn secret_or_generate(secret: Option<String>) -> Result<SubscriptionSecret, SubscriptionError> {
    match secret {
        None => Ok(SubscriptionSecret::generate()),
        Some(secret) if secret.trim().len() < MIN_SECRET_LEN => Err(SubscriptionError::Validation(format!(
            "secret must be at least {MIN_SECRET_LEN} characters"
        ))),
        Some(secret) => Ok(SubscriptionSecret::new(secret)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use forgemes_events::EventTypeDefinition;

    async fn registry() -> SubscriptionRegistry {
        let store = Arc::new(InMemoryStore::new());
        let types = Arc::new(EventTypeRegistry::new(store.clone()));
        types
            .register(&EventTypeDefinition::new("batch.closed", 1, ""))
            .await
            .unwrap();
        SubscriptionRegistry::new(store.clone(), store, types)
    }

    fn request(url: &str) -> NewSubscription {
        NewSubscription {
            endpoint_url: url.to_string(),
            event_types: vec!["batch.closed".to_string()],
            ..NewSubscription::default()
        }
    }

    #[tokio::test]
    async fn create_generates_a_secret() {
        let subs = registry().await;
        let (sub, secret) = subs.create(request("https://mes.example.com/hooks")).await.unwrap();
        assert!(sub.active);
        assert_eq!(secret.expose().len(), 64);
        assert_eq!(subs.get(sub.id).await.unwrap().secret, secret);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let subs = registry().await;
        assert!(matches!(
            subs.create(request("mailto:ops@example.com")).await,
            Err(SubscriptionError::Validation(_))
        ));

        let unknown = NewSubscription {
            event_types: vec!["batch.vanished".into()],
            ..request("https://mes.example.com/hooks")
        };
        assert!(matches!(subs.create(unknown).await, Err(SubscriptionError::Validation(_))));

        let short = NewSubscription {
            secret: Some("tiny".into()),
            ..request("https://mes.example.com/hooks")
        };
        assert!(matches!(subs.create(short).await, Err(SubscriptionError::Validation(_))));
    }

    #[tokio::test]
    async fn deactivate_and_rotate() {
        let subs = registry().await;
        let (sub, old) = subs.create(request("https://mes.example.com/hooks")).await.unwrap();

        let off = subs.deactivate(sub.id).await.unwrap();
        assert!(!off.active);

        let new = subs.rotate_secret(sub.id, None).await.unwrap();
        assert_ne!(new, old);
        assert!(matches!(
            subs.rotate_secret(SubscriptionId::new(), None).await,
            Err(SubscriptionError::NotFound(_))
        ));
    }
}
