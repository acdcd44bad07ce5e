//! Observability Module
//!
//! Provides observability for the metal-api server:
//! - `metrics`: Prometheus metrics for wait streams, notifications and retries
//! - `events`: Structured event logging with consistent fields
//! - `tracing`: Subscriber setup with optional OpenTelemetry export

pub mod events;
pub mod metrics;
pub mod tracing;

pub use metrics::{init_metrics, MetricsState};
pub use tracing::{init_tracing, shutdown_tracing, TracingConfig};
