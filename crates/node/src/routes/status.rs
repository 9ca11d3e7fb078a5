use axum::extract::State;
use axum::{routing::get, Json, Router};
use peerwork_queue::CoordinatorStatus;

use crate::state::AppState;

/// GET /status -- coordinator state, peer load estimates and local worker
/// loads.
async fn status(State(state): State<AppState>) -> Json<CoordinatorStatus> {
    Json(state.coordinator.status().await)
}

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(status))
}
