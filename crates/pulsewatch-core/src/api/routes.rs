//! API routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Queues
        .route("/api/v1/queues", get(handlers::list_queues))
        .route("/api/v1/queues/:name/dlq-review", post(handlers::request_dlq_review))

        // Scheduling
        .route("/api/v1/schedule/run", post(handlers::run_schedule))

        .with_state(state)
}
