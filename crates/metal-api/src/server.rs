//! Server Assembly
//!
//! Builds the store, bus, wait and lifecycle components for one replica
//! and wires them into the HTTP application state.

use crate::api::{self, AppState};
use crate::bus::{EtcdEventBus, EventBus, MemoryEventBus, Subscription};
use crate::config::{ServerConfig, StoreBackend};
use crate::error::{BusError, StoreError};
use crate::observability::MetricsState;
use crate::provisioning::ProvisioningService;
use crate::retry::ConflictRetrier;
use crate::store::{
    etcd, EtcdEventLog, EtcdMachineStore, EventLog, MachineStore, MemoryEventLog,
    MemoryMachineStore,
};
use crate::wait::{AllocationNotifier, WaitCoordinator, WaitRegistry};
use axum::Router;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Storage and messaging backends shared by all components.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn MachineStore>,
    pub event_log: Arc<dyn EventLog>,
    pub bus: Arc<dyn EventBus>,
}

impl Backends {
    /// Single-process backends; allocations only reach waiters on this replica.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryMachineStore::new()),
            event_log: Arc::new(MemoryEventLog::new()),
            bus: Arc::new(MemoryEventBus::new()),
        }
    }

    pub async fn etcd(config: &ServerConfig) -> Result<Self, StoreError> {
        info!(endpoints = ?config.etcd_endpoints, "Connecting to etcd");
        let client = etcd::connect(&config.etcd_endpoints).await?;
        info!("Connected to etcd");

        Ok(Self {
            store: Arc::new(EtcdMachineStore::new(client.clone())),
            event_log: Arc::new(EtcdEventLog::new(client.clone())),
            bus: Arc::new(EtcdEventBus::new(client, &config.bus)),
        })
    }

    pub async fn from_config(config: &ServerConfig) -> Result<Self, StoreError> {
        match config.store_backend {
            StoreBackend::Etcd => Self::etcd(config).await,
            StoreBackend::Memory => Ok(Self::memory()),
        }
    }
}

/// One replica's components.
pub struct Server {
    state: AppState,
    notifier: Arc<AllocationNotifier>,
}

impl Server {
    pub fn new(config: &ServerConfig, backends: Backends, metrics_state: Option<MetricsState>) -> Self {
        let registry = Arc::new(WaitRegistry::new());
        let retrier = ConflictRetrier::new(config.retry.clone());

        let notifier = Arc::new(AllocationNotifier::new(
            backends.bus.clone(),
            registry.clone(),
            &config.node_id,
            &config.bus,
        ));

        let coordinator = Arc::new(WaitCoordinator::new(
            backends.store.clone(),
            registry,
            retrier.clone(),
            config.wait,
            config.node_id.clone(),
        ));

        let service = Arc::new(ProvisioningService::new(
            backends.store.clone(),
            backends.event_log,
            notifier.clone(),
            retrier,
        ));

        let state = AppState {
            node_id: config.node_id.clone(),
            store: backends.store,
            service,
            coordinator,
            readiness: Arc::new(AtomicBool::new(false)),
            metrics_state,
            shutdown: CancellationToken::new(),
        };

        Self { state, notifier }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Subscribe to allocation events and mark the replica ready. The
    /// replica stays unready if the subscription cannot be established.
    pub async fn start(&self) -> Result<Subscription, BusError> {
        let subscription = self.notifier.subscribe().await?;
        self.state.set_ready(true);
        info!(subscription = %subscription.name(), "Replica ready");
        Ok(subscription)
    }

    pub fn router(&self) -> Router {
        api::create_router(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WaitError;
    use crate::models::{AllocateRequest, RegisterRequest};
    use crate::wait::{KeepaliveSink, WaitOutcome};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl KeepaliveSink for NullSink {
        async fn send_keepalive(&mut self) -> Result<(), WaitError> {
            Ok(())
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            store_backend: StoreBackend::Memory,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_marks_ready() {
        let server = Server::new(&config(), Backends::memory(), None);
        assert!(!server.state().is_ready());

        let subscription = server.start().await.unwrap();
        assert!(server.state().is_ready());
        let prefix = format!("{}-", server.state().node_id);
        assert!(subscription.name().starts_with(&prefix));
    }

    #[tokio::test]
    async fn test_allocation_reaches_waiter_on_other_replica() {
        // Two replicas sharing store and bus; the stream is held by `a`,
        // the allocation lands on `b`.
        let backends = Backends::memory();
        let a = Server::new(&config(), backends.clone(), None);
        let b = Server::new(&config(), backends, None);
        let _sub_a = a.start().await.unwrap();
        let _sub_b = b.start().await.unwrap();

        b.state()
            .service
            .register("m1", RegisterRequest::default())
            .await
            .unwrap();

        let coordinator = a.state().coordinator.clone();
        let waiter = tokio::spawn(async move {
            let mut sink = NullSink;
            coordinator
                .wait("m1", None, &mut sink, &CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        b.state()
            .service
            .allocate(
                "m1",
                AllocateRequest {
                    project: "p1".into(),
                    hostname: "h1".into(),
                    image: "img".into(),
                    ..AllocateRequest::default()
                },
            )
            .await
            .unwrap();

        // Well under the default 60s check interval, so the bus did it.
        let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Allocated);
        assert!(a.state().coordinator.registry().is_empty());
    }
}
