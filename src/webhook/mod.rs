//! HTTP surface: the mutating admission endpoint plus probes.

pub mod health;
mod mutate;

use axum::{
    Router,
    routing::{get, post},
};
pub use mutate::{annotation_patch, mutate_handler};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::AppState;

/// Path registered in the MutatingWebhookConfiguration.
pub const MUTATE_PATH: &str = "/mutate-v1-serviceaccount";

pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let mut app = Router::new()
        .route(MUTATE_PATH, post(mutate_handler))
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness));

    if config.observability.metrics.enabled {
        app = app.route("/metrics", get(health::metrics));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}
