//! HTTP facade: the REST API the core's operations are served through.

pub mod handlers;
pub mod models;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::AppState;

/// Build the full router. Mounted at the root by [`crate::Application::serve`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(handlers::create_task).get(handlers::list_tasks))
        .route("/tasks/batch", post(handlers::batch_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .route("/tasks/{id}/wait", post(handlers::wait_task))
        .route("/models", post(handlers::register_model).get(handlers::list_models))
        .route("/webhooks", post(handlers::register_webhook))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
