//! Unified error handling for the agent.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] paysync_engine::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Io(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Engine(paysync_engine::Error::AlreadySyncing) => StatusCode::CONFLICT,
            AppError::Engine(paysync_engine::Error::Auth(_)) => StatusCode::UNAUTHORIZED,
            AppError::Engine(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!(error = ?e, "database error");
                ("Database error".to_string(), None)
            }
            AppError::Engine(e) => {
                tracing::warn!(error = %e, "engine error");
                (e.to_string(), None)
            }
            AppError::Io(e) => {
                tracing::error!(error = %e, "snapshot i/o error");
                ("Snapshot storage error".to_string(), Some(e.to_string()))
            }
            AppError::BadRequest(msg) => (msg.clone(), None),
            AppError::Internal(msg) => {
                tracing::error!(%msg, "internal error");
                ("Internal server error".to_string(), Some(msg.clone()))
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
