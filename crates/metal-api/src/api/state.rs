//! Application State
//!
//! Shared state passed to all API handlers.

use crate::observability::MetricsState;
use crate::provisioning::ProvisioningService;
use crate::store::MachineStore;
use crate::wait::WaitCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub store: Arc<dyn MachineStore>,
    pub service: Arc<ProvisioningService>,
    pub coordinator: Arc<WaitCoordinator>,
    /// Set once the allocation subscription is running
    pub readiness: Arc<AtomicBool>,
    pub metrics_state: Option<MetricsState>,
    /// Parent of every wait stream's cancellation; fired on shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn is_ready(&self) -> bool {
        self.readiness.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.readiness.store(ready, Ordering::Release);
    }
}
