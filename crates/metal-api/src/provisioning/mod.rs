//! Machine Lifecycle
//!
//! The unary machine flows that share the store with the wait protocol:
//! registration, switch wiring, allocation, VRF assignment, the final
//! report and reinstall aborts. Every mutation is a read-modify-write under
//! the conflict retrier; allocation additionally notifies waiting streams.

use crate::error::{ServiceError, StoreError};
use crate::models::{
    AllocateRequest, Allocation, MachineRecord, ProvisioningEvent, ProvisioningEventKind,
    RegisterRequest, ReportRequest, SwitchConnection,
};
use crate::observability::events;
use crate::retry::ConflictRetrier;
use crate::store::{EventLog, MachineStore};
use crate::wait::AllocationNotifier;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub struct ProvisioningService {
    store: Arc<dyn MachineStore>,
    event_log: Arc<dyn EventLog>,
    notifier: Arc<AllocationNotifier>,
    retrier: ConflictRetrier,
}

impl ProvisioningService {
    pub fn new(
        store: Arc<dyn MachineStore>,
        event_log: Arc<dyn EventLog>,
        notifier: Arc<AllocationNotifier>,
        retrier: ConflictRetrier,
    ) -> Self {
        Self {
            store,
            event_log,
            notifier,
            retrier,
        }
    }

    pub async fn find(&self, machine_id: &str) -> Result<MachineRecord, ServiceError> {
        Ok(self.store.find_by_id(machine_id).await?.value)
    }

    pub async fn events(&self, machine_id: &str) -> Result<Vec<ProvisioningEvent>, ServiceError> {
        // Distinguish an unknown machine from one without history.
        self.store.find_by_id(machine_id).await?;
        Ok(self.event_log.list(machine_id).await?)
    }

    /// Create the record, or refresh hardware and merge wiring of a known one.
    #[instrument(skip(self, req), fields(machine_id = %machine_id))]
    pub async fn register(
        &self,
        machine_id: &str,
        req: RegisterRequest,
    ) -> Result<MachineRecord, ServiceError> {
        let store = &self.store;
        let req = &req;

        let (record, created) = self
            .retrier
            .run("register", move || async move {
                match store.find_by_id(machine_id).await {
                    Ok(current) => {
                        let mut next = current.value.clone();
                        if !req.partition.is_empty() {
                            next.partition = req.partition.clone();
                        }
                        next.hardware = req.hardware.clone();
                        next.attach_connections(&req.connections);
                        next.changed_at = Utc::now();
                        let updated = store.update(&current, &next).await?;
                        Ok((updated.value, false))
                    }
                    // A concurrent create makes this a conflict and the next
                    // attempt takes the update path.
                    Err(StoreError::NotFound(_)) => {
                        let mut record = MachineRecord::new(machine_id);
                        record.partition = req.partition.clone();
                        record.hardware = req.hardware.clone();
                        record.attach_connections(&req.connections);
                        let created = store.create(&record).await?;
                        Ok((created.value, true))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        events::machine_registered(machine_id, &record.partition, created);
        self.record_event(
            machine_id,
            ProvisioningEventKind::Registered,
            if created {
                "machine registered"
            } else {
                "machine re-registered"
            },
        )
        .await;
        Ok(record)
    }

    /// Merge NIC-to-switch wiring. Connections already attached are kept as is.
    #[instrument(skip(self, connections), fields(machine_id = %machine_id))]
    pub async fn attach_switch_connections(
        &self,
        machine_id: &str,
        connections: &[SwitchConnection],
    ) -> Result<MachineRecord, ServiceError> {
        self.modify("attach_switch_connections", machine_id, |record| {
            Ok(record.attach_connections(connections) > 0)
        })
        .await
    }

    /// Allocate the machine, then wake its wait stream wherever it is held.
    #[instrument(skip(self, req), fields(machine_id = %machine_id, project = %req.project))]
    pub async fn allocate(
        &self,
        machine_id: &str,
        req: AllocateRequest,
    ) -> Result<MachineRecord, ServiceError> {
        let record = self
            .modify("allocate", machine_id, |record| {
                if record.is_allocated() {
                    return Err(ServiceError::AlreadyAllocated(record.id.clone()));
                }
                record.allocation = Some(Allocation::from(req.clone()));
                Ok(true)
            })
            .await?;

        self.notifier.notify(machine_id).await;

        events::machine_allocated(machine_id, &req.project, &req.hostname);
        self.record_event(
            machine_id,
            ProvisioningEventKind::Allocated,
            &format!("allocated to project {} as {}", req.project, req.hostname),
        )
        .await;
        Ok(record)
    }

    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub async fn assign_vrf(&self, machine_id: &str, vrf: u32) -> Result<MachineRecord, ServiceError> {
        self.modify("assign_vrf", machine_id, |record| {
            let allocation = allocation_mut(record)?;
            if allocation.vrf == Some(vrf) {
                return Ok(false);
            }
            allocation.vrf = Some(vrf);
            Ok(true)
        })
        .await
    }

    /// Final report of the machine after installation.
    #[instrument(skip(self, req), fields(machine_id = %machine_id, success = req.success))]
    pub async fn report(
        &self,
        machine_id: &str,
        req: ReportRequest,
    ) -> Result<MachineRecord, ServiceError> {
        let record = self
            .modify("report", machine_id, |record| {
                let allocation = allocation_mut(record)?;
                allocation.succeeded = req.success;
                allocation.report_message = req.message.clone();
                Ok(true)
            })
            .await?;

        let (kind, default_message) = if req.success {
            (ProvisioningEventKind::Provisioned, "installation succeeded")
        } else {
            (ProvisioningEventKind::Failed, "installation failed")
        };
        let message = req.message.as_deref().unwrap_or(default_message);
        self.record_event(machine_id, kind, message).await;
        Ok(record)
    }

    /// The machine gave up on a reinstall. Unless the primary disk was
    /// already wiped, the allocation falls back to a regular boot.
    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub async fn abort_reinstall(
        &self,
        machine_id: &str,
        primary_disk_wiped: bool,
    ) -> Result<MachineRecord, ServiceError> {
        let record = self
            .modify("abort_reinstall", machine_id, |record| {
                match record.allocation.as_mut() {
                    Some(allocation) if allocation.reinstall && !primary_disk_wiped => {
                        allocation.reinstall = false;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await?;

        self.record_event(
            machine_id,
            ProvisioningEventKind::ReinstallAborted,
            "machine sent extended reinstall error",
        )
        .await;
        Ok(record)
    }

    /// Read, apply `mutate`, and write back under the retrier. `mutate`
    /// returns false when nothing changed, which skips the write.
    async fn modify<F>(
        &self,
        operation: &str,
        machine_id: &str,
        mutate: F,
    ) -> Result<MachineRecord, ServiceError>
    where
        F: Fn(&mut MachineRecord) -> Result<bool, ServiceError> + Sync,
    {
        let store = &self.store;
        let mutate = &mutate;

        self.retrier
            .run(operation, move || async move {
                let current = store.find_by_id(machine_id).await?;
                let mut next = current.value.clone();
                if !mutate(&mut next)? {
                    debug!(machine_id = %machine_id, operation = %operation, "No change to write");
                    return Ok::<_, ServiceError>(current.value);
                }
                next.changed_at = Utc::now();
                Ok(store.update(&current, &next).await?.value)
            })
            .await
    }

    async fn record_event(&self, machine_id: &str, kind: ProvisioningEventKind, message: &str) {
        let event = ProvisioningEvent::new(kind, message);
        if let Err(e) = self.event_log.append(machine_id, event).await {
            warn!(machine_id = %machine_id, kind = %kind, error = %e, "Failed to record provisioning event");
        }
    }
}

fn allocation_mut(record: &mut MachineRecord) -> Result<&mut Allocation, ServiceError> {
    let id = record.id.clone();
    record
        .allocation
        .as_mut()
        .ok_or(ServiceError::NotAllocated(id))
}
