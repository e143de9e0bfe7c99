//! Health check endpoints.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::registry::NodeStatus;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: always "ok" while the process serves requests.
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeCounts>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct NodeCounts {
    pub online: usize,
    pub enrolled: usize,
    pub connected: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness probe; checks nothing beyond the process answering.
async fn healthz() -> impl IntoResponse {
    Json(response(None))
}

/// Readiness probe with the current fleet counts.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.registry().list().await;
    let counts = NodeCounts {
        online: nodes
            .iter()
            .filter(|node| node.status == NodeStatus::Online)
            .count(),
        enrolled: nodes.len(),
        connected: state.hub().connected_nodes().await.len(),
    };
    Json(response(Some(counts)))
}

fn response(nodes: Option<NodeCounts>) -> HealthResponse {
    HealthResponse {
        status: "ok".to_string(),
        service: "controller".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        nodes,
    }
}
