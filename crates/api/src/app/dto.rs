use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use forgemes_outbox::{EventTypeRegistry, NewSubscription, Subscription, SubscriptionPatch, WebhookDelivery};

pub const DEFAULT_DELIVERY_LIMIT: usize = 50;
pub const MAX_DELIVERY_LIMIT: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub endpoint_url: String,
    pub event_types: Vec<String>,
    pub secret: Option<String>,
    pub description: Option<String>,
}

impl From<CreateSubscriptionRequest> for NewSubscription {
    fn from(req: CreateSubscriptionRequest) -> Self {
        NewSubscription {
            endpoint_url: req.endpoint_url,
            event_types: req.event_types,
            secret: req.secret,
            description: req.description,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSubscriptionRequest {
    pub endpoint_url: Option<String>,
    pub event_types: Option<Vec<String>>,
    pub active: Option<bool>,
    pub description: Option<String>,
}

impl From<UpdateSubscriptionRequest> for SubscriptionPatch {
    fn from(req: UpdateSubscriptionRequest) -> Self {
        SubscriptionPatch {
            endpoint_url: req.endpoint_url,
            event_types: req.event_types,
            active: req.active,
            description: req.description,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RotateSecretRequest {
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveriesQuery {
    pub limit: Option<usize>,
}

impl DeliveriesQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_DELIVERY_LIMIT).clamp(1, MAX_DELIVERY_LIMIT)
    }
}

// -------------------------
// Response mapping
// -------------------------

/// Event types are shown by name; ids unknown to the cache fall back to the
/// raw id. The secret is never included.
pub fn subscription_to_json(sub: &Subscription, registry: &EventTypeRegistry) -> serde_json::Value {
    let mut event_types: Vec<String> = sub
        .event_types
        .iter()
        .map(|id| registry.by_id(*id).map_or_else(|| id.to_string(), |t| t.name))
        .collect();
    event_types.sort();

    json!({
        "id": sub.id.to_string(),
        "endpoint_url": sub.endpoint_url,
        "event_types": event_types,
        "active": sub.active,
        "description": sub.description,
        "created_at": sub.created_at,
        "updated_at": sub.updated_at,
    })
}

pub fn delivery_to_json(d: &WebhookDelivery) -> serde_json::Value {
    json!({
        "id": d.id.to_string(),
        "event_id": d.outbox_event_id.to_string(),
        "subscription_id": d.subscription_id.to_string(),
        "status": d.status.as_str(),
        "attempts": d.attempts,
        "next_attempt_at": d.next_attempt_at,
        "last_response_code": d.last_response_code,
        "last_error": d.last_error,
        "delivered_at": d.delivered_at,
        "updated_at": d.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_limit_is_bounded() {
        assert_eq!(DeliveriesQuery::default().limit(), DEFAULT_DELIVERY_LIMIT);
        assert_eq!(DeliveriesQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(DeliveriesQuery { limit: Some(10_000) }.limit(), MAX_DELIVERY_LIMIT);
    }
}
