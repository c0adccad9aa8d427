//! Collaborator interfaces to the orchestration platform
//!
//! The observer reads pods and reads/writes `DatapathResult` records through
//! two traits. Implementations exist for the Kubernetes API server and for an
//! in-memory store with the same optimistic-concurrency semantics.

mod kubernetes;
mod memory;

pub use kubernetes::{
    instance_from_pod, pods_api, result_api_resource, KubeInstanceApi, KubeResultStore,
};
pub use memory::{InMemoryInstanceApi, InMemoryResultStore};

use crate::models::{DatapathResult, InstanceKey, WorkloadInstance};
use crate::selector::LabelSelector;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Errors signalled by the platform stores
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict writing {0}: object has been modified")]
    Conflict(String),
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Namespace and label equality filter for list calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub namespace: Option<String>,
    pub labels: LabelSelector,
}

impl ListFilter {
    pub fn new(namespace: Option<String>, labels: LabelSelector) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            labels,
        }
    }

    pub fn matches(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        self.namespace.as_deref().map(|ns| ns == namespace).unwrap_or(true)
            && self.labels.matches(labels)
    }
}

/// Read access to pods, plus the annotation patch used by the reporter
#[async_trait]
pub trait InstanceApi: Send + Sync {
    async fn get(&self, key: &InstanceKey) -> Result<WorkloadInstance, StoreError>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<WorkloadInstance>, StoreError>;

    /// Merge the given annotations into the pod's metadata
    async fn patch_annotations(
        &self,
        key: &InstanceKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;
}

/// Durable storage for derived records
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn list(&self, filter: &ListFilter) -> Result<Vec<DatapathResult>, StoreError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<DatapathResult, StoreError>;

    /// Fails with `AlreadyExists` when a record with the same name exists
    async fn create(&self, record: DatapathResult) -> Result<DatapathResult, StoreError>;

    /// Conditional write: fails with `Conflict` unless `record.resource_version`
    /// matches the stored version
    async fn update(&self, record: DatapathResult) -> Result<DatapathResult, StoreError>;
}
