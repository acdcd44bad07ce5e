//! Allocation Wait Protocol
//!
//! Machines block in a long-poll wait until an operator allocates them.
//! - `registry`: per-replica map from machine id to its wake signal
//! - `notifier`: publishes allocation events and wakes local waiters
//! - `coordinator`: the per-stream state machine with keep-alive and polling fallback

pub mod coordinator;
pub mod notifier;
pub mod registry;

pub use coordinator::{KeepaliveSink, WaitCoordinator, WaitOutcome};
pub use notifier::AllocationNotifier;
pub use registry::{Registration, WaitRegistry, Wake, WakeSignal};

/// Wait protocol version served by this build. Clients announcing another
/// version get `501 Not Implemented` and must restart instead of retrying.
pub const WAIT_PROTOCOL_VERSION: u32 = 1;
