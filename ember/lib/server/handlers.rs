//! HTTP request handlers for the control API.
//!
//! Each handler delegates to a `handle_*` function returning an [`EmberResult`] and maps the
//! outcome onto a status code and JSON body.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::{
    management::{CreateVmRequest, RestoreVmRequest, VmInfo},
    runtime::SnapshotReport,
    EmberError, EmberResult,
};

use super::{
    state::ServerState,
    types::{
        DeleteResponse, ErrorResponse, ListResponse, SnapshotRequest, VmIdRequest, VmResponse,
    },
};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for the POST /create endpoint
///
/// Builds and boots a VM. Responds once the guest is running.
pub async fn create_handler(
    State(state): State<ServerState>,
    Json(req): Json<CreateVmRequest>,
) -> impl IntoResponse {
    match handle_create(state, req).await {
        Ok(vm) => (StatusCode::CREATED, Json(VmResponse { vm })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /delete endpoint
pub async fn delete_handler(
    State(state): State<ServerState>,
    Json(req): Json<VmIdRequest>,
) -> impl IntoResponse {
    match handle_delete(state, req.id.clone()).await {
        Ok(()) => (StatusCode::OK, Json(DeleteResponse { deleted: req.id })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /stop endpoint
///
/// Pauses the guest.
pub async fn stop_handler(
    State(state): State<ServerState>,
    Json(req): Json<VmIdRequest>,
) -> impl IntoResponse {
    vm_response(state.manager().stop(&req.id).await)
}

/// Handler for the POST /resume endpoint
pub async fn resume_handler(
    State(state): State<ServerState>,
    Json(req): Json<VmIdRequest>,
) -> impl IntoResponse {
    vm_response(state.manager().resume(&req.id).await)
}

/// Handler for the GET /list endpoint
pub async fn list_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let vms = state.manager().list().await;
    (StatusCode::OK, Json(ListResponse { vms })).into_response()
}

/// Handler for the GET /info/{id} endpoint
pub async fn info_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    vm_response(state.manager().info(&id).await)
}

/// Handler for the POST /snapshot endpoint
pub async fn snapshot_handler(
    State(state): State<ServerState>,
    Json(req): Json<SnapshotRequest>,
) -> impl IntoResponse {
    match handle_snapshot(state, req).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /restore endpoint
pub async fn restore_handler(
    State(state): State<ServerState>,
    Json(req): Json<RestoreVmRequest>,
) -> impl IntoResponse {
    match handle_restore(state, req).await {
        Ok(vm) => (StatusCode::CREATED, Json(VmResponse { vm })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Maps an error onto the status code the API reports it with.
pub fn status_for(error: &EmberError) -> StatusCode {
    match error {
        EmberError::Validation(_) | EmberError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        EmberError::NotFound(_) => StatusCode::NOT_FOUND,
        EmberError::InvalidState(_)
        | EmberError::InvalidTransition { .. }
        | EmberError::SocketInUse(_)
        | EmberError::Allocation(_)
        | EmberError::DuplicateVm(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

//-------------------------------------------------------------------------------------------------
// Functions: Helpers
//-------------------------------------------------------------------------------------------------

/// Runs the boot in its own task. A client hanging up cancels it through the token, which rolls
/// back whatever was set up.
async fn handle_create(state: ServerState, req: CreateVmRequest) -> EmberResult<VmInfo> {
    let cancel = state.request_token();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let manager = state.manager().clone();

    tokio::spawn(async move { manager.create(req, &cancel).await }).await?
}

async fn handle_restore(state: ServerState, req: RestoreVmRequest) -> EmberResult<VmInfo> {
    let cancel = state.request_token();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let manager = state.manager().clone();

    tokio::spawn(async move { manager.restore(req, &cancel).await }).await?
}

async fn handle_delete(state: ServerState, id: String) -> EmberResult<()> {
    let manager = state.manager().clone();
    tokio::spawn(async move { manager.delete(&id).await }).await?
}

async fn handle_snapshot(state: ServerState, req: SnapshotRequest) -> EmberResult<SnapshotReport> {
    let manager = state.manager().clone();

    // A dropped request must not leave the guest paused.
    tokio::spawn(async move {
        manager
            .snapshot(&req.id, req.base.as_deref(), req.kind)
            .await
    })
    .await?
}

fn vm_response(result: EmberResult<VmInfo>) -> Response {
    match result {
        Ok(vm) => (StatusCode::OK, Json(VmResponse { vm })).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: EmberError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!(error = %error, "request failed");
    } else {
        tracing::debug!(error = %error, status = %status, "request rejected");
    }

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}
