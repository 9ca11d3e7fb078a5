use std::sync::Arc;

use peerwork_queue::Coordinator;

/// Shared application state available to all Axum handlers via
/// `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// This node's coordinator; also owns the store.
    pub coordinator: Arc<Coordinator>,
}
