//! In-memory machine store
//!
//! Same compare-and-swap semantics as the etcd store: a single store-wide
//! revision counter, bumped on every write.

use super::{MachineStore, Versioned};
use crate::error::StoreError;
use crate::models::MachineRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    revision: i64,
    records: HashMap<String, (MachineRecord, i64)>,
}

#[derive(Default)]
pub struct MemoryMachineStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl MemoryMachineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage: every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Overwrite a record regardless of its revision.
    pub async fn put(&self, record: MachineRecord) -> i64 {
        let mut inner = self.inner.write().await;
        inner.revision += 1;
        let revision = inner.revision;
        inner.records.insert(record.id.clone(), (record, revision));
        revision
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MachineStore for MemoryMachineStore {
    async fn find_by_id(&self, id: &str) -> Result<Versioned<MachineRecord>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .map(|(record, revision)| Versioned::new(record.clone(), *revision))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create(&self, record: &MachineRecord) -> Result<Versioned<MachineRecord>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::Conflict {
                id: record.id.clone(),
            });
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .records
            .insert(record.id.clone(), (record.clone(), revision));
        Ok(Versioned::new(record.clone(), revision))
    }

    async fn update(
        &self,
        old: &Versioned<MachineRecord>,
        new: &MachineRecord,
    ) -> Result<Versioned<MachineRecord>, StoreError> {
        self.check_available()?;
        let id = &old.value.id;
        let mut inner = self.inner.write().await;
        match inner.records.get(id) {
            None => return Err(StoreError::NotFound(id.clone())),
            Some((_, current)) if *current != old.revision => {
                return Err(StoreError::Conflict { id: id.clone() });
            }
            Some(_) => {}
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.records.insert(id.clone(), (new.clone(), revision));
        Ok(Versioned::new(new.clone(), revision))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_rejects_stale_revision() {
        let store = MemoryMachineStore::new();
        let created = store.create(&MachineRecord::new("m1")).await.unwrap();

        let mut first = created.value.clone();
        first.waiting = true;
        let updated = store.update(&created, &first).await.unwrap();
        assert!(updated.revision > created.revision);

        // A writer still holding the earlier read loses.
        let mut second = created.value.clone();
        second.partition = "fra-1".to_string();
        let err = store.update(&created, &second).await.unwrap_err();
        assert!(err.is_conflict());

        let current = store.find_by_id("m1").await.unwrap();
        assert!(current.value.waiting);
        assert_eq!(current.revision, updated.revision);
    }

    #[tokio::test]
    async fn test_create_existing_is_conflict() {
        let store = MemoryMachineStore::new();
        store.create(&MachineRecord::new("m1")).await.unwrap();
        let err = store.create(&MachineRecord::new("m1")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_missing_and_unavailable() {
        let store = MemoryMachineStore::new();
        assert!(store.find_by_id("nope").await.unwrap_err().is_not_found());

        store.set_unavailable(true);
        assert!(matches!(
            store.ping().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
