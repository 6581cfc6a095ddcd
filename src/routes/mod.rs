pub mod health;
pub mod invites;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Application routes, without the metrics endpoint or middleware layers.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/questions/{question_id}/send-invites",
            post(invites::send_invites),
        )
        .route(
            "/api/v1/invites/batches/{batch_id}",
            get(invites::batch_status),
        )
        .with_state(state)
}
