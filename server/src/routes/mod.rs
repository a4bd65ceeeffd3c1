//! HTTP surface for the UI layer.

mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// `/health` plus the `/sync` family.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .nest("/sync", sync::routes())
}
