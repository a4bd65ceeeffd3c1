//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"syncing"` while a cycle holds the engine
    pub status: &'static str,
    pub version: &'static str,
}

impl HealthResponse {
    fn new(syncing: bool) -> Self {
        Self {
            status: if syncing { "syncing" } else { "ok" },
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health - Liveness plus whether a cycle is running.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(state.agent.orchestrator().is_syncing()))
}
