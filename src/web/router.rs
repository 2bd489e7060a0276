//! Route definitions for web server.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use super::api;
use crate::bureau::BureauState;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Relay routes, served only when the bureau acts as a mailbox relay.
pub fn create_relay_router() -> Router<Arc<BureauState>> {
    Router::new()
        .route("/v1/mailbox/submit", post(api::relay_submit))
        .route("/v1/mailbox/:address", get(api::relay_drain))
}

/// Create the full app router.
pub fn create_app_router(state: Arc<BureauState>, relay: bool) -> Router {
    let mut router = Router::new()
        .route("/submit", post(api::submit))
        .route("/agents", get(api::list_agents))
        .route("/agents/:address", get(api::get_agent))
        .route("/health", get(health_check));

    if relay {
        router = router.merge(create_relay_router());
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
