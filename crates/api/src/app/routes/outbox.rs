use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use forgemes_core::EventId;

use crate::app::AdminServices;
use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/:event_id/retry", post(retry_event))
}

/// POST /outbox/:event_id/retry - FAILED events and DEAD deliveries only.
pub async fn retry_event(
    Extension(services): Extension<Arc<AdminServices>>,
    Path(event_id): Path<String>,
) -> axum::response::Response {
    let event_id: EventId = match errors::parse_id(&event_id, "event") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.admin.retry(event_id).await {
        Ok(report) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "event_id": report.event_id.to_string(),
                "reset_deliveries": report.reset_deliveries,
            })),
        )
            .into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

/// GET /outbox/stats - row counts from the store plus this process's counters.
pub async fn stats(Extension(services): Extension<Arc<AdminServices>>) -> axum::response::Response {
    match services.admin.stats().await {
        Ok(outbox) => (
            StatusCode::OK,
            Json(json!({
                "outbox": outbox,
                "dispatcher": services.admin.metrics(),
            })),
        )
            .into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}
