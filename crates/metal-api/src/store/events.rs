//! Provisioning event log
//!
//! Append-only lifecycle history per machine. Entries are written under
//! `/metal/events/{id}/{nanos}-{uuid}` so a prefix read returns them in
//! chronological order.

use crate::error::StoreError;
use crate::models::ProvisioningEvent;
use async_trait::async_trait;
use etcd_client::{Client, GetOptions, SortOrder, SortTarget};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Prefix for provisioning event keys in etcd
pub const EVENTS_PREFIX: &str = "/metal/events/";

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, machine_id: &str, event: ProvisioningEvent) -> Result<(), StoreError>;

    async fn list(&self, machine_id: &str) -> Result<Vec<ProvisioningEvent>, StoreError>;
}

#[derive(Clone)]
pub struct EtcdEventLog {
    client: Client,
}

impl EtcdEventLog {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn prefix(machine_id: &str) -> String {
        format!("{EVENTS_PREFIX}{machine_id}/")
    }
}

#[async_trait]
impl EventLog for EtcdEventLog {
    async fn append(&self, machine_id: &str, event: ProvisioningEvent) -> Result<(), StoreError> {
        let nanos = event.time.timestamp_nanos_opt().unwrap_or_default();
        let key = format!(
            "{}{:020}-{}",
            Self::prefix(machine_id),
            nanos,
            uuid::Uuid::new_v4()
        );
        let value = serde_json::to_vec(&event)?;
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn list(&self, machine_id: &str) -> Result<Vec<ProvisioningEvent>, StoreError> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let mut client = self.client.clone();
        let resp = client.get(Self::prefix(machine_id), Some(options)).await?;
        resp.kvs()
            .iter()
            .map(|kv| serde_json::from_slice(kv.value()).map_err(StoreError::from))
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<HashMap<String, Vec<ProvisioningEvent>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, machine_id: &str, event: ProvisioningEvent) -> Result<(), StoreError> {
        self.events
            .write()
            .await
            .entry(machine_id.to_string())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list(&self, machine_id: &str) -> Result<Vec<ProvisioningEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .get(machine_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProvisioningEventKind;

    #[tokio::test]
    async fn test_memory_log_keeps_order() {
        let log = MemoryEventLog::new();
        log.append("m1", ProvisioningEvent::new(ProvisioningEventKind::Registered, ""))
            .await
            .unwrap();
        log.append("m1", ProvisioningEvent::new(ProvisioningEventKind::Allocated, "p1"))
            .await
            .unwrap();

        let events = log.list("m1").await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ProvisioningEventKind::Registered, ProvisioningEventKind::Allocated]
        );
        assert!(log.list("m2").await.unwrap().is_empty());
    }

    #[test]
    fn test_event_prefix() {
        assert_eq!(EtcdEventLog::prefix("m1"), "/metal/events/m1/");
    }
}
