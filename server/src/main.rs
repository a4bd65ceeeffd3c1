//! PaySync Agent - runs the offline-first sync engine for contract payment
//! documents against PostgreSQL.
//!
//! The local cache lives in memory and is persisted as a JSON snapshot after
//! every cycle. A small HTTP API lets the UI layer trigger cycles and read
//! the sync status.

mod agent;
mod config;
mod db;
mod error;
mod persist;
mod routes;

use crate::agent::Agent;
use crate::config::Config;
use crate::db::PgRemoteStore;
use crate::persist::SnapshotFile;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent<PgRemoteStore>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "paysync_agent=debug,paysync_engine=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(addr = %config.bind_addr(), "Starting PaySync Agent");

    // The pool connects lazily; the agent keeps working offline until the
    // database is reachable, and migrations run on first contact.
    let pool = db::create_pool(&config.database_url, config.sync.remote_timeout())?;
    let registry = paysync_engine::domain::contract_registry()?;
    let remote = Arc::new(PgRemoteStore::new(pool, registry));

    let agent = Agent::open(
        remote,
        SnapshotFile::new(config.snapshot_path.clone()),
        config.sync.clone(),
    )
    .await?;
    let agent = Arc::new(agent);

    if config.sync.auto_sync {
        agent.start_auto_sync().await;
    }

    // Build application state
    let state = AppState {
        agent: agent.clone(),
    };

    // Build router
    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Agent listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    agent.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
