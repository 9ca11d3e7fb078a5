//! Node controller process library.
//!
//! Exposes configuration, shared state and the HTTP status routes so the
//! binary entrypoint and integration tests build the same application.

pub mod config;
pub mod routes;
pub mod state;

use axum::Router;
use tower_http::trace::TraceLayer;

use state::AppState;

/// The status application: health and coordinator status routes with
/// request tracing.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::status::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
