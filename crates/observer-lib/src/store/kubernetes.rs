//! Kubernetes API server backends
//!
//! Pods are read through the typed `Api<Pod>`. `DatapathResult` records are
//! custom resources (`perf.github.com/v1`), accessed as `DynamicObject`s so no
//! generated CRD type is needed.

use super::{InstanceApi, ListFilter, ResultStore, StoreError};
use crate::models::{
    DatapathResult, DatapathResultSpec, InstanceKey, InstancePhase, WorkloadInstance,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

pub const RESULT_GROUP: &str = "perf.github.com";
pub const RESULT_VERSION: &str = "v1";
pub const RESULT_KIND: &str = "DatapathResult";
pub const RESULT_PLURAL: &str = "datapathresults";

/// API resource descriptor for `DatapathResult`
pub fn result_api_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(RESULT_GROUP, RESULT_VERSION, RESULT_KIND);
    ApiResource::from_gvk_with_plural(&gvk, RESULT_PLURAL)
}

/// Pod API scoped to a namespace, or cluster-wide when `None`
pub fn pods_api(client: Client, namespace: Option<&str>) -> Api<Pod> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn list_params(filter: &ListFilter) -> ListParams {
    if filter.labels.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&filter.labels.to_string())
    }
}

fn map_error(err: kube::Error, what: String) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(what),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(what)
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(what),
        other => StoreError::Backend(format!("{}: {}", what, other)),
    }
}

/// Convert a pod into the observer's view of it
pub fn instance_from_pod(pod: &Pod) -> WorkloadInstance {
    let meta = &pod.metadata;
    let status = pod.status.as_ref();
    WorkloadInstance {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        creation_timestamp: meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(DateTime::<Utc>::default),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.as_deref())
            .map(InstancePhase::from)
            .unwrap_or_default(),
        reason: status.and_then(|s| s.reason.clone()).unwrap_or_default(),
        message: status.and_then(|s| s.message.clone()).unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
    }
}

/// Pod access through the API server
#[derive(Clone)]
pub struct KubeInstanceApi {
    client: Client,
}

impl KubeInstanceApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceApi for KubeInstanceApi {
    async fn get(&self, key: &InstanceKey) -> Result<WorkloadInstance, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let pod = api
            .get(&key.name)
            .await
            .map_err(|e| map_error(e, format!("pod {}", key)))?;
        Ok(instance_from_pod(&pod))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<WorkloadInstance>, StoreError> {
        let api = pods_api(self.client.clone(), filter.namespace.as_deref());
        let pods = api
            .list(&list_params(filter))
            .await
            .map_err(|e| map_error(e, "pods".to_string()))?;
        Ok(pods.items.iter().map(instance_from_pod).collect())
    }

    async fn patch_annotations(
        &self,
        key: &InstanceKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations,
            }
        });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, format!("pod {}", key)))?;
        debug!(pod = %key, keys = annotations.len(), "Merged pod annotations");
        Ok(())
    }
}

/// `DatapathResult` access through the API server
#[derive(Clone)]
pub struct KubeResultStore {
    client: Client,
    resource: ApiResource,
}

impl KubeResultStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: result_api_resource(),
        }
    }

    fn namespaced(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

fn encode_spec(record: &DatapathResult) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(&record.spec)
        .map_err(|e| StoreError::Backend(format!("encode {}: {}", record.name, e)))
}

/// Full object for `create`. Pod labels are mirrored onto the record's
/// metadata so list calls can filter server-side.
fn record_to_object(
    record: &DatapathResult,
    resource: &ApiResource,
) -> Result<DynamicObject, StoreError> {
    let spec = encode_spec(record)?;
    let mut object = DynamicObject::new(&record.name, resource)
        .within(&record.namespace)
        .data(serde_json::json!({ "spec": spec }));
    object.metadata.resource_version = record.resource_version.clone();
    if !record.spec.labels.is_empty() {
        object.metadata.labels = Some(record.spec.labels.clone());
    }
    Ok(object)
}

/// Merge patch for `update`, conditional on the record's resource version.
/// Metadata the observer does not own is left untouched.
fn record_update_patch(record: &DatapathResult) -> Result<serde_json::Value, StoreError> {
    let resource_version = record.resource_version.as_deref().ok_or_else(|| {
        StoreError::Backend(format!("update {}: missing resourceVersion", record.name))
    })?;
    let mut metadata = serde_json::json!({ "resourceVersion": resource_version });
    if !record.spec.labels.is_empty() {
        metadata["labels"] = serde_json::json!(record.spec.labels);
    }
    Ok(serde_json::json!({
        "metadata": metadata,
        "spec": encode_spec(record)?,
    }))
}

fn record_from_object(object: DynamicObject) -> Result<DatapathResult, StoreError> {
    let name = object.metadata.name.clone().unwrap_or_default();
    let spec = object
        .data
        .get("spec")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let spec: DatapathResultSpec = serde_json::from_value(spec)
        .map_err(|e| StoreError::Backend(format!("decode {}: {}", name, e)))?;
    Ok(DatapathResult {
        namespace: object.metadata.namespace.unwrap_or_default(),
        name,
        resource_version: object.metadata.resource_version,
        spec,
    })
}

#[async_trait]
impl ResultStore for KubeResultStore {
    async fn list(&self, filter: &ListFilter) -> Result<Vec<DatapathResult>, StoreError> {
        let api: Api<DynamicObject> = match filter.namespace.as_deref() {
            Some(ns) => self.namespaced(ns),
            None => Api::all_with(self.client.clone(), &self.resource),
        };
        let objects = api
            .list(&list_params(filter))
            .await
            .map_err(|e| map_error(e, RESULT_PLURAL.to_string()))?;
        objects.items.into_iter().map(record_from_object).collect()
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<DatapathResult, StoreError> {
        let object = self
            .namespaced(namespace)
            .get(name)
            .await
            .map_err(|e| map_error(e, format!("datapathresult {}/{}", namespace, name)))?;
        record_from_object(object)
    }

    async fn create(&self, record: DatapathResult) -> Result<DatapathResult, StoreError> {
        let mut object = record_to_object(&record, &self.resource)?;
        object.metadata.resource_version = None;
        let created = self
            .namespaced(&record.namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| {
                map_error(e, format!("datapathresult {}/{}", record.namespace, record.name))
            })?;
        record_from_object(created)
    }

    async fn update(&self, record: DatapathResult) -> Result<DatapathResult, StoreError> {
        let patch = record_update_patch(&record)?;
        let patched = self
            .namespaced(&record.namespace)
            .patch(&record.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                map_error(e, format!("datapathresult {}/{}", record.namespace, record.name))
            })?;
        record_from_object(patched)
    }
}
