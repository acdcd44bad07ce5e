//! Machine Store
//!
//! Persisted machine records with optimistic concurrency control. Every
//! mutation is a compare-and-swap against the revision that was read:
//! - `etcd`: records in etcd, CAS via `mod_revision` transactions
//! - `memory`: in-process map with the same semantics, for tests and dev
//! - `events`: provisioning event log

pub mod etcd;
pub mod events;
pub mod memory;

pub use etcd::EtcdMachineStore;
pub use events::{EtcdEventLog, EventLog, MemoryEventLog};
pub use memory::MemoryMachineStore;

use crate::error::StoreError;
use crate::models::MachineRecord;
use async_trait::async_trait;

/// A value together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: i64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, revision: i64) -> Self {
        Self { value, revision }
    }
}

#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Fetch a record, or `StoreError::NotFound`.
    async fn find_by_id(&self, id: &str) -> Result<Versioned<MachineRecord>, StoreError>;

    /// Create a record that must not exist yet; an existing key is a conflict.
    async fn create(&self, record: &MachineRecord) -> Result<Versioned<MachineRecord>, StoreError>;

    /// Write `new` only if the stored record is still at `old.revision`.
    async fn update(
        &self,
        old: &Versioned<MachineRecord>,
        new: &MachineRecord,
    ) -> Result<Versioned<MachineRecord>, StoreError>;

    /// Cheap connectivity check for liveness probes.
    async fn ping(&self) -> Result<(), StoreError>;
}
