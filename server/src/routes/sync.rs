//! Sync endpoint routes.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    routing::{get, post},
    Json, Router,
};
use paysync_engine::{SyncResult, SyncStatus};
use serde::Deserialize;
use tracing::info;

use crate::error::{AppError, Result};
use crate::AppState;

/// Query parameters for `POST /sync/pull`.
#[derive(Debug, Default, Deserialize)]
pub struct PullQuery {
    /// Reset every table cursor before pulling
    #[serde(default)]
    pub full: bool,
}

/// Routes mounted under `/sync`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(sync_all))
        .route("/push", post(force_push))
        .route("/pull", post(force_pull))
        .route("/status", get(status))
}

/// POST /sync - Push then pull every table.
async fn sync_all(State(state): State<AppState>) -> Result<Json<SyncResult>> {
    let result = state.agent.sync_all().await?;
    Ok(Json(result))
}

/// POST /sync/push - Push dirty records only.
async fn force_push(State(state): State<AppState>) -> Result<Json<SyncResult>> {
    let result = state.agent.force_push().await?;
    Ok(Json(result))
}

/// POST /sync/pull?full=bool - Pull only, optionally from the epoch.
async fn force_pull(
    State(state): State<AppState>,
    query: std::result::Result<Query<PullQuery>, QueryRejection>,
) -> Result<Json<SyncResult>> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    if query.full {
        info!("Full resync requested over HTTP");
    }
    let result = state.agent.force_pull(query.full).await?;
    Ok(Json(result))
}

/// GET /sync/status - Current engine status.
async fn status(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.agent.orchestrator().get_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Uri;

    fn parse(uri: &str) -> std::result::Result<PullQuery, QueryRejection> {
        let uri: Uri = uri.parse().unwrap();
        Query::<PullQuery>::try_from_uri(&uri).map(|Query(q)| q)
    }

    #[test]
    fn pull_query_defaults_to_incremental() {
        assert!(!parse("/sync/pull").unwrap().full);
        assert!(parse("/sync/pull?full=true").unwrap().full);
        assert!(!parse("/sync/pull?full=false").unwrap().full);
    }

    #[test]
    fn pull_query_rejects_non_boolean() {
        assert!(parse("/sync/pull?full=yes").is_err());
    }
}
