//! metal-api - Bare-Metal Provisioning Control Plane

use anyhow::Context;
use metal_api::config::ServerConfig;
use metal_api::observability::{init_metrics, init_tracing, shutdown_tracing, TracingConfig};
use metal_api::server::{Backends, Server};
use metal_api::version;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(TracingConfig::from_env())
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to initialize tracing")?;

    info!(version = %version::full_version(), "Starting metal-api");
    debug!("{}", version::build_info());

    let metrics_state = match init_metrics() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Failed to initialize metrics, /metrics disabled");
            None
        }
    };

    let config = ServerConfig::from_env();
    info!(
        node_id = %config.node_id,
        bind_addr = %config.bind_addr,
        store_backend = %config.store_backend,
        response_interval = ?config.wait.response_interval,
        check_interval = ?config.wait.check_interval,
        "Loaded configuration"
    );

    let backends = Backends::from_config(&config)
        .await
        .context("failed to connect to backing store")?;
    let server = Server::new(&config, backends, metrics_state);

    let subscription = server
        .start()
        .await
        .context("failed to subscribe to allocation events")?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(bind_addr = %config.bind_addr, "Starting API server");

    // Open wait streams end with `cancelled` on shutdown so clients move
    // to another replica.
    let shutdown = server.state().shutdown.clone();
    axum::serve(listener, server.router())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("API server failed")?;

    info!("Shutting down");
    server.state().set_ready(false);
    subscription.close().await;
    shutdown_tracing();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
