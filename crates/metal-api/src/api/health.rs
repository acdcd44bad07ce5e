//! Health Check Endpoints
//!
//! Liveness and readiness probe handlers for Kubernetes, plus build info.

use super::state::AppState;
use crate::version;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::time::Duration;

const STORE_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness probe endpoint. Verifies the machine store is reachable.
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    match tokio::time::timeout(STORE_PING_TIMEOUT, state.store.ping()).await {
        Ok(Ok(())) => Ok("OK"),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "store health check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(_) => {
            tracing::warn!("store health check timed out");
            Err(StatusCode::REQUEST_TIMEOUT)
        }
    }
}

/// Readiness probe endpoint. Returns OK once allocation events are flowing.
#[tracing::instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if state.is_ready() {
        Ok("READY")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub git_branch: &'static str,
    pub built: &'static str,
    pub rustc: &'static str,
    pub wait_protocol: u32,
    pub node_id: String,
}

/// GET /version - build metadata of this replica
pub async fn get_version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: version::VERSION,
        git_sha: version::GIT_SHA,
        git_branch: version::GIT_BRANCH,
        built: version::BUILD_TIMESTAMP,
        rustc: version::RUSTC_VERSION,
        wait_protocol: crate::wait::WAIT_PROTOCOL_VERSION,
        node_id: state.node_id,
    })
}
