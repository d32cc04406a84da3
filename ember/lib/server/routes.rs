//! Route definitions and the listener loop.

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::EmberResult;

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates a router with every API endpoint configured.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/create", post(handlers::create_handler))
        .route("/delete", post(handlers::delete_handler))
        .route("/stop", post(handlers::stop_handler))
        .route("/resume", post(handlers::resume_handler))
        .route("/list", get(handlers::list_handler))
        .route("/info/{id}", get(handlers::info_handler))
        .route("/snapshot", post(handlers::snapshot_handler))
        .route("/restore", post(handlers::restore_handler))
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> EmberResult<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, create_router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
