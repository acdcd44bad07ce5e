//! Machine Lifecycle Endpoints
//!
//! Unary REST handlers over the provisioning service. Every handler
//! returns the machine record as it was written.

use super::state::AppState;
use crate::error::ServiceError;
use crate::models::{
    AllocateRequest, MachineRecord, ProvisioningEvent, RegisterRequest, ReportRequest,
    SwitchConnection,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Debug, Deserialize)]
pub struct VrfRequest {
    pub vrf: u32,
}

#[derive(Debug, Deserialize)]
pub struct AbortReinstallRequest {
    #[serde(default)]
    pub primary_disk_wiped: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionsRequest {
    pub connections: Vec<SwitchConnection>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub machine_id: String,
    pub events: Vec<ProvisioningEvent>,
}

/// Map a service error onto the HTTP status the caller acts on.
pub(crate) fn error_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::AlreadyAllocated(_) | ServiceError::NotAllocated(_) => StatusCode::CONFLICT,
        ServiceError::Store(e) if e.is_conflict() => StatusCode::CONFLICT,
        ServiceError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Reject ids that would reach outside their own store key prefix.
pub(crate) fn validate_machine_id(machine_id: &str) -> Result<(), (StatusCode, String)> {
    if machine_id.is_empty() || machine_id.contains('/') {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("invalid machine id {machine_id:?}"),
        ));
    }
    Ok(())
}

fn reject(err: ServiceError) -> (StatusCode, String) {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::warn!(error = %err, "Machine request failed");
    }
    (status, err.to_string())
}

/// GET /v1/machines/{id}
#[tracing::instrument(skip(state))]
pub async fn get_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> ApiResult<MachineRecord> {
    validate_machine_id(&machine_id)?;
    state.service.find(&machine_id).await.map(Json).map_err(reject)
}

/// GET /v1/machines/{id}/events
#[tracing::instrument(skip(state))]
pub async fn get_events(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> ApiResult<EventsResponse> {
    validate_machine_id(&machine_id)?;
    let events = state.service.events(&machine_id).await.map_err(reject)?;
    Ok(Json(EventsResponse { machine_id, events }))
}

/// POST /v1/machines/{id}/register
#[tracing::instrument(skip(state, req))]
pub async fn register(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<MachineRecord> {
    validate_machine_id(&machine_id)?;
    state
        .service
        .register(&machine_id, req)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /v1/machines/{id}/connections
#[tracing::instrument(skip(state, req))]
pub async fn attach_connections(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(req): Json<ConnectionsRequest>,
) -> ApiResult<MachineRecord> {
    validate_machine_id(&machine_id)?;
    state
        .service
        .attach_switch_connections(&machine_id, &req.connections)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /v1/machines/{id}/allocate
#[tracing::instrument(skip(state, req))]
pub async fn allocate(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(req): Json<AllocateRequest>,
) -> ApiResult<MachineRecord> {
    validate_machine_id(&machine_id)?;
    state
        .service
        .allocate(&machine_id, req)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /v1/machines/{id}/vrf
#[tracing::instrument(skip(state))]
pub async fn assign_vrf(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(req): Json<VrfRequest>,
) -> ApiResult<MachineRecord> {
    validate_machine_id(&machine_id)?;
    state
        .service
        .assign_vrf(&machine_id, req.vrf)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /v1/machines/{id}/report
#[tracing::instrument(skip(state, req))]
pub async fn report(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<MachineRecord> {
    validate_machine_id(&machine_id)?;
    state
        .service
        .report(&machine_id, req)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /v1/machines/{id}/abort-reinstall
#[tracing::instrument(skip(state))]
pub async fn abort_reinstall(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(req): Json<AbortReinstallRequest>,
) -> ApiResult<MachineRecord> {
    validate_machine_id(&machine_id)?;
    state
        .service
        .abort_reinstall(&machine_id, req.primary_disk_wiped)
        .await
        .map(Json)
        .map_err(reject)
}
