//! Subscription management endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use forgemes_core::SubscriptionId;

use crate::app::AdminServices;
use crate::app::dto::{
    self, CreateSubscriptionRequest, DeliveriesQuery, ReplayRequest, RotateSecretRequest, UpdateSubscriptionRequest,
};
use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_subscription).get(list_subscriptions))
        .route("/:id", get(get_subscription).patch(update_subscription))
        .route("/:id/deactivate", post(deactivate_subscription))
        .route("/:id/rotate-secret", post(rotate_secret))
        .route("/:id/deliveries", get(recent_deliveries))
        .route("/:id/replay", post(replay))
}

/// POST /subscriptions - the generated or supplied secret is returned once.
pub async fn create_subscription(
    Extension(services): Extension<Arc<AdminServices>>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> axum::response::Response {
    match services.subscriptions.create(body.into()).await {
        Ok((sub, secret)) => {
            let mut view = dto::subscription_to_json(&sub, &services.registry);
            view["secret"] = json!(secret.expose());
            (StatusCode::CREATED, Json(view)).into_response()
        }
        Err(e) => errors::subscription_error_to_response(e),
    }
}

pub async fn list_subscriptions(Extension(services): Extension<Arc<AdminServices>>) -> axum::response::Response {
    match services.subscriptions.list().await {
        Ok(subs) => {
            let items: Vec<_> = subs
                .iter()
                .map(|s| dto::subscription_to_json(s, &services.registry))
                .collect();
            (StatusCode::OK, Json(json!({ "count": items.len(), "items": items }))).into_response()
        }
        Err(e) => errors::subscription_error_to_response(e),
    }
}

pub async fn get_subscription(
    Extension(services): Extension<Arc<AdminServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: SubscriptionId = match errors::parse_id(&id, "subscription") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.subscriptions.get(id).await {
        Ok(sub) => (StatusCode::OK, Json(dto::subscription_to_json(&sub, &services.registry))).into_response(),
        Err(e) => errors::subscription_error_to_response(e),
    }
}

pub async fn update_subscription(
    Extension(services): Extension<Arc<AdminServices>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSubscriptionRequest>,
) -> axum::response::Response {
    let id: SubscriptionId = match errors::parse_id(&id, "subscription") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.subscriptions.update(id, body.into()).await {
        Ok(sub) => (StatusCode::OK, Json(dto::subscription_to_json(&sub, &services.registry))).into_response(),
        Err(e) => errors::subscription_error_to_response(e),
    }
}

pub async fn deactivate_subscription(
    Extension(services): Extension<Arc<AdminServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: SubscriptionId = match errors::parse_id(&id, "subscription") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.subscriptions.deactivate(id).await {
        Ok(sub) => (StatusCode::OK, Json(dto::subscription_to_json(&sub, &services.registry))).into_response(),
        Err(e) => errors::subscription_error_to_response(e),
    }
}

/// POST /subscriptions/:id/rotate-secret - body is optional; without a
/// `secret` field a new one is generated.
pub async fn rotate_secret(
    Extension(services): Extension<Arc<AdminServices>>,
    Path(id): Path<String>,
    body: Option<Json<RotateSecretRequest>>,
) -> axum::response::Response {
    let id: SubscriptionId = match errors::parse_id(&id, "subscription") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let requested = body.and_then(|Json(b)| b.secret);
    match services.subscriptions.rotate_secret(id, requested).await {
        Ok(secret) => (
            StatusCode::OK,
            Json(json!({ "id": id.to_string(), "secret": secret.expose() })),
        )
            .into_response(),
        Err(e) => errors::subscription_error_to_response(e),
    }
}

/// GET /subscriptions/:id/deliveries?limit= - newest first.
pub async fn recent_deliveries(
    Extension(services): Extension<Arc<AdminServices>>,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> axum::response::Response {
    let id: SubscriptionId = match errors::parse_id(&id, "subscription") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.subscriptions.recent_deliveries(id, query.limit()).await {
        Ok(deliveries) => {
            let items: Vec<_> = deliveries.iter().map(dto::delivery_to_json).collect();
            (StatusCode::OK, Json(json!({ "count": items.len(), "items": items }))).into_response()
        }
        Err(e) => errors::subscription_error_to_response(e),
    }
}

pub async fn replay(
    Extension(services): Extension<Arc<AdminServices>>,
    Path(id): Path<String>,
    Json(body): Json<ReplayRequest>,
) -> axum::response::Response {
    let id: SubscriptionId = match errors::parse_id(&id, "subscription") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.admin.replay(id, body.since, body.until).await {
        Ok(report) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "subscription_id": id.to_string(),
                "events": report.events,
                "deliveries": report.deliveries,
            })),
        )
            .into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}
