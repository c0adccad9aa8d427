//! In-memory stores
//!
//! Used by tests and local runs. Records carry a monotonically increasing
//! resource version so conditional updates behave like the API server's.

use super::{InstanceApi, ListFilter, ResultStore, StoreError};
use crate::models::{DatapathResult, InstanceKey, WorkloadInstance};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Pod store with a call counter on annotation patches
#[derive(Debug, Default)]
pub struct InMemoryInstanceApi {
    instances: RwLock<BTreeMap<InstanceKey, WorkloadInstance>>,
    patch_calls: AtomicUsize,
}

impl InMemoryInstanceApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a pod
    pub async fn upsert(&self, instance: WorkloadInstance) {
        let mut instances = self.instances.write().await;
        instances.insert(instance.key(), instance);
    }

    /// Number of `patch_annotations` calls received
    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceApi for InMemoryInstanceApi {
    async fn get(&self, key: &InstanceKey) -> Result<WorkloadInstance, StoreError> {
        self.instances
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("pod {}", key)))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<WorkloadInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| filter.matches(&i.namespace, &i.labels))
            .cloned()
            .collect())
    }

    async fn patch_annotations(
        &self,
        key: &InstanceKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("pod {}", key)))?;
        for (k, v) in annotations {
            instance.annotations.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

/// Record store with optimistic concurrency
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: RwLock<BTreeMap<(String, String), DatapathResult>>,
    version: AtomicU64,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn list(&self, filter: &ListFilter) -> Result<Vec<DatapathResult>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(&r.namespace, r.labels()))
            .cloned()
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<DatapathResult, StoreError> {
        self.records
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("datapathresult {}/{}", namespace, name)))
    }

    async fn create(&self, mut record: DatapathResult) -> Result<DatapathResult, StoreError> {
        let mut records = self.records.write().await;
        let id = (record.namespace.clone(), record.name.clone());
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(format!(
                "datapathresult {}/{}",
                id.0, id.1
            )));
        }
        record.resource_version = Some(self.next_version());
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, mut record: DatapathResult) -> Result<DatapathResult, StoreError> {
        let mut records = self.records.write().await;
        let id = (record.namespace.clone(), record.name.clone());
        let current = records
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("datapathresult {}/{}", id.0, id.1)))?;
        if current.resource_version != record.resource_version {
            return Err(StoreError::Conflict(format!("datapathresult {}/{}", id.0, id.1)));
        }
        record.resource_version = Some(self.next_version());
        records.insert(id, record.clone());
        Ok(record)
    }
}
