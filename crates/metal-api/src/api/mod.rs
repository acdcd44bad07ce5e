//! HTTP API Module
//!
//! REST API endpoints for the metal-api server.
//!
//! This module contains:
//! - `state`: Shared application state
//! - `health`: Liveness and readiness probes, build info
//! - `metrics`: Prometheus metrics endpoint
//! - `machines`: Machine lifecycle operations
//! - `wait`: Allocation wait stream (server-sent events)

mod health;
mod machines;
mod metrics;
mod state;
mod wait;

pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/version", get(health::get_version))
        // Observability
        .route("/metrics", get(metrics::get_metrics))
        // Machine lifecycle
        .route("/v1/machines/{id}", get(machines::get_machine))
        .route("/v1/machines/{id}/events", get(machines::get_events))
        .route("/v1/machines/{id}/register", post(machines::register))
        .route("/v1/machines/{id}/connections", post(machines::attach_connections))
        .route("/v1/machines/{id}/allocate", post(machines::allocate))
        .route("/v1/machines/{id}/vrf", post(machines::assign_vrf))
        .route("/v1/machines/{id}/report", post(machines::report))
        .route("/v1/machines/{id}/abort-reinstall", post(machines::abort_reinstall))
        // Allocation wait
        .route("/v1/machines/{id}/wait", get(wait::wait_for_allocation))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, StoreBackend};
    use crate::server::{Backends, Server};
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::Json;

    fn server() -> Server {
        let config = ServerConfig {
            store_backend: StoreBackend::Memory,
            ..ServerConfig::default()
        };
        Server::new(&config, Backends::memory(), None)
    }

    #[tokio::test]
    async fn test_wait_rejects_unknown_protocol() {
        let server = server();
        let params = wait::WaitParams {
            protocol: Some(crate::wait::WAIT_PROTOCOL_VERSION + 1),
            timeout_secs: None,
        };
        let result = wait::wait_for_allocation(
            State(server.state().clone()),
            Path("m1".to_string()),
            Query(params),
        )
        .await;

        match result {
            Err((status, _)) => assert_eq!(status, StatusCode::NOT_IMPLEMENTED),
            Ok(_) => panic!("unsupported protocol must be rejected"),
        }
    }

    #[tokio::test]
    async fn test_probes() {
        let server = server();
        let state = server.state().clone();

        assert_eq!(health::health_check(State(state.clone())).await, Ok("OK"));
        assert_eq!(
            health::readiness_check(State(state.clone())).await,
            Err(StatusCode::SERVICE_UNAVAILABLE)
        );

        let _subscription = server.start().await.unwrap();
        assert_eq!(health::readiness_check(State(state)).await, Ok("READY"));
    }

    #[tokio::test]
    async fn test_machine_handlers_map_errors() {
        let server = server();
        let state = server.state().clone();

        let missing = machines::get_machine(State(state.clone()), Path("m1".to_string())).await;
        assert_eq!(missing.unwrap_err().0, StatusCode::NOT_FOUND);

        machines::register(
            State(state.clone()),
            Path("m1".to_string()),
            Json(Default::default()),
        )
        .await
        .unwrap();

        let unallocated = machines::assign_vrf(
            State(state.clone()),
            Path("m1".to_string()),
            Json(machines::VrfRequest { vrf: 7 }),
        )
        .await;
        assert_eq!(unallocated.unwrap_err().0, StatusCode::CONFLICT);

        let Json(record) = machines::get_machine(State(state), Path("m1".to_string()))
            .await
            .unwrap();
        assert_eq!(record.id, "m1");
    }

    #[tokio::test]
    async fn test_slash_in_machine_id_is_rejected() {
        let server = server();
        let state = server.state().clone();

        // `a%2Fb` in the path decodes to `a/b`.
        let registered = machines::register(
            State(state.clone()),
            Path("a/b".to_string()),
            Json(Default::default()),
        )
        .await;
        assert_eq!(registered.unwrap_err().0, StatusCode::BAD_REQUEST);

        let waited = wait::wait_for_allocation(
            State(state),
            Path("a/b".to_string()),
            Query(wait::WaitParams::default()),
        )
        .await;
        match waited {
            Err((status, _)) => assert_eq!(status, StatusCode::BAD_REQUEST),
            Ok(_) => panic!("id with a slash must be rejected"),
        }
    }
}
