//! Etcd-backed machine store
//!
//! Records are stored as JSON under `/metal/machines/{id}`. The etcd
//! `mod_revision` of the key is the record version; updates are
//! transactions that only apply while the key is still at the read revision.

use super::{MachineStore, Versioned};
use crate::error::StoreError;
use crate::models::MachineRecord;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp};
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix for machine keys in etcd
pub const MACHINES_PREFIX: &str = "/metal/machines/";

/// Connect to etcd with exponential backoff
pub async fn connect(endpoints: &[String]) -> Result<Client, StoreError> {
    let backoff = ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(10),
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    retry(backoff, || async {
        match Client::connect(endpoints, None).await {
            Ok(client) => {
                debug!("Connected to etcd");
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, "etcd connection failed, retrying");
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await
    .map_err(StoreError::from)
}

#[derive(Clone)]
pub struct EtcdMachineStore {
    client: Client,
}

impl EtcdMachineStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn key(id: &str) -> String {
        format!("{MACHINES_PREFIX}{id}")
    }

    /// Commit a conditional put and translate a failed compare into a conflict.
    async fn put_if(
        &self,
        id: &str,
        compare: Compare,
        record: &MachineRecord,
    ) -> Result<Versioned<MachineRecord>, StoreError> {
        let key = Self::key(id);
        let value = serde_json::to_vec(record)?;
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, value, None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            debug!(machine_id = %id, "Optimistic update rejected");
            return Err(StoreError::Conflict { id: id.to_string() });
        }

        // The put is the only write in the txn, so the header revision is the key's new mod_revision.
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(Versioned::new(record.clone(), revision))
    }
}

#[async_trait]
impl MachineStore for EtcdMachineStore {
    async fn find_by_id(&self, id: &str) -> Result<Versioned<MachineRecord>, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(Self::key(id), None).await?;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let record: MachineRecord = serde_json::from_slice(kv.value())?;
        Ok(Versioned::new(record, kv.mod_revision()))
    }

    async fn create(&self, record: &MachineRecord) -> Result<Versioned<MachineRecord>, StoreError> {
        let compare = Compare::create_revision(Self::key(&record.id), CompareOp::Equal, 0);
        self.put_if(&record.id, compare, record).await
    }

    async fn update(
        &self,
        old: &Versioned<MachineRecord>,
        new: &MachineRecord,
    ) -> Result<Versioned<MachineRecord>, StoreError> {
        let compare = Compare::mod_revision(Self::key(&old.value.id), CompareOp::Equal, old.revision);
        self.put_if(&old.value.id, compare, new).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.status().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_key() {
        assert_eq!(EtcdMachineStore::key("m1"), "/metal/machines/m1");
    }
}
