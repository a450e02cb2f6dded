//! Router assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use faultbox_action::Coordinator;
use faultbox_engine::Discovery;

use crate::handlers;

/// Shared state of the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    /// The action coordinator.
    pub coordinator: Arc<Coordinator>,
    /// The discovery poller.
    pub discovery: Arc<Discovery>,
}

/// Builds the action protocol router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::manifest))
        .route("/discovery/targets", get(handlers::discovery_targets))
        .route("/:action/prepare", post(handlers::prepare))
        .route("/:action/start", post(handlers::start))
        .route("/:action/status", post(handlers::status))
        .route("/:action/stop", post(handlers::stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the health router served on its own port.
pub fn health_router(state: AppState) -> Router {
    Router::new()
        .route("/health/liveness", get(handlers::liveness))
        .route("/health/readiness", get(handlers::readiness))
        .with_state(state)
}
