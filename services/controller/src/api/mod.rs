//! HTTP routing: health probes and the node WebSocket endpoint.

mod health;
mod nodes;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use nodes::NODE_SOCKET_PATH;

/// Create the main router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(nodes::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
