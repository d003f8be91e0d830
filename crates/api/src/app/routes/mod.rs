use axum::Router;

pub mod outbox;
pub mod subscriptions;
pub mod system;

/// Router for every admin endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/subscriptions", subscriptions::router())
        .nest("/outbox", outbox::router())
}
