use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use forgemes_outbox::{AdminError, StoreError, SubscriptionError};

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Transient(msg) => {
            error!(error = %msg, "storage unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        StoreError::NotFound(what) => json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Validation(msg) => json_error(StatusCode::UNPROCESSABLE_ENTITY, "rejected", msg),
        StoreError::Serialization(msg) => {
            error!(error = %msg, "stored row could not be decoded");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn subscription_error_to_response(err: SubscriptionError) -> axum::response::Response {
    match err {
        SubscriptionError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        SubscriptionError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("subscription {id} not found"))
        }
        SubscriptionError::Store(e) => store_error_to_response(e),
    }
}

pub fn admin_error_to_response(err: AdminError) -> axum::response::Response {
    match err {
        AdminError::NotFound(what) => json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
        e @ AdminError::NotEligible { .. } => json_error(StatusCode::CONFLICT, "not_eligible", e.to_string()),
        AdminError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        AdminError::Store(e) => store_error_to_response(e),
    }
}

/// Parse a path id, answering 400 when it is not a UUID.
pub fn parse_id<T: FromStr>(raw: &str, what: &'static str) -> Result<T, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id")))
}
