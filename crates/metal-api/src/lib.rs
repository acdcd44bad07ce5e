//! metal-api Server Library
//!
//! Control plane for bare-metal machines: registration, allocation, and the
//! long-poll wait that wakes a machine once it has been allocated, on
//! whichever replica holds its stream.

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod provisioning;
pub mod retry;
pub mod server;
pub mod store;
pub mod version;
pub mod wait;
