//! Structured Events
//!
//! Provides structured event logging with consistent fields across the application.
//! Each event type has a dedicated function that ensures consistent field naming.
//!
//! Event types:
//! - `wait_started` - Machine opened a wait stream
//! - `wait_finished` - Wait stream ended (allocated, cancelled, error)
//! - `allocation_published` - Allocation event sent to the bus
//! - `allocation_publish_failed` - Bus publish failed; polling will catch up
//! - `allocation_delivered` - Allocation event arrived at this replica
//! - `conflict_retry` - Optimistic update lost a race and is being retried
//! - `bus_handler_failed` - Subscription handler errored, panicked or timed out
//! - `machine_registered` - Machine registered or re-registered
//! - `machine_allocated` - Operator allocated a machine

use tracing::{debug, error, info, warn};

/// Emit a wait started event
pub fn wait_started(machine_id: &str, node_id: &str) {
    info!(
        event_type = "wait_started",
        machine_id = %machine_id,
        node_id = %node_id,
        "Machine waiting for allocation"
    );
}

/// Emit a wait finished event. Cancellation is expected and logged at debug.
pub fn wait_finished(machine_id: &str, outcome: &str, error: Option<&str>) {
    match (outcome, error) {
        ("cancelled", _) => debug!(
            event_type = "wait_finished",
            machine_id = %machine_id,
            outcome = %outcome,
            "Wait cancelled"
        ),
        (_, Some(error)) => warn!(
            event_type = "wait_finished",
            machine_id = %machine_id,
            outcome = %outcome,
            error = %error,
            "Wait failed"
        ),
        (_, None) => info!(
            event_type = "wait_finished",
            machine_id = %machine_id,
            outcome = %outcome,
            "Wait finished"
        ),
    }
}

/// Emit an allocation published event
pub fn allocation_published(machine_id: &str, topic: &str) {
    debug!(
        event_type = "allocation_published",
        machine_id = %machine_id,
        topic = %topic,
        "Allocation event published"
    );
}

/// Emit an allocation publish failed event
pub fn allocation_publish_failed(machine_id: &str, topic: &str, error: &str) {
    warn!(
        event_type = "allocation_publish_failed",
        machine_id = %machine_id,
        topic = %topic,
        error = %error,
        "Failed to publish allocation event, waiting machine relies on polling"
    );
}

/// Emit an allocation delivered event
pub fn allocation_delivered(machine_id: &str, subscription: &str, woke_waiter: bool) {
    debug!(
        event_type = "allocation_delivered",
        machine_id = %machine_id,
        subscription = %subscription,
        woke_waiter = woke_waiter,
        "Allocation event delivered"
    );
}

/// Emit a conflict retry event
pub fn conflict_retry(operation: &str, attempt: u32, max_attempts: u32, delay_ms: u64) {
    debug!(
        event_type = "conflict_retry",
        operation = %operation,
        attempt = attempt,
        max_attempts = max_attempts,
        delay_ms = delay_ms,
        "Concurrent modification, retrying"
    );
}

/// Emit a bus handler failed event
pub fn bus_handler_failed(subscription: &str, message_id: &str, error: &str) {
    error!(
        event_type = "bus_handler_failed",
        subscription = %subscription,
        message_id = %message_id,
        error = %error,
        "Bus handler failed"
    );
}

/// Emit a machine registered event
pub fn machine_registered(machine_id: &str, partition: &str, created: bool) {
    info!(
        event_type = "machine_registered",
        machine_id = %machine_id,
        partition = %partition,
        created = created,
        "Machine registered"
    );
}

/// Emit a machine allocated event
pub fn machine_allocated(machine_id: &str, project: &str, hostname: &str) {
    info!(
        event_type = "machine_allocated",
        machine_id = %machine_id,
        project = %project,
        hostname = %hostname,
        "Machine allocated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_functions_dont_panic() {
        wait_started("machine-1", "node-1");
        wait_finished("machine-1", "allocated", None);
        wait_finished("machine-1", "cancelled", Some("client gone"));
        wait_finished("machine-1", "error", Some("store down"));
        allocation_published("machine-1", "machine.allocation");
        allocation_publish_failed("machine-1", "machine.allocation", "etcd down");
        allocation_delivered("machine-1", "node-1-abc", true);
        conflict_retry("register", 2, 10, 150);
        bus_handler_failed("node-1-abc", "msg-1", "timed out");
        machine_registered("machine-1", "fra-1", true);
        machine_allocated("machine-1", "project-1", "web-01");
    }
}
