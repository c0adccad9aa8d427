//! Core data models for the datapath observer

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation written by the reporter when its container starts
pub const START_TS_ANNOTATION: &str = "perf.github.com/azure-start-ts";

/// Annotation written by the reporter once the datapath probe succeeds
pub const DP_READY_TS_ANNOTATION: &str = "perf.github.com/azure-dp-ready-ts";

/// Prefix of every derived record name
pub const RESULT_NAME_PREFIX: &str = "dpresult-";

/// Format a timestamp the way annotations and records carry it
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an annotation or record timestamp
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Name of the derived record for a pod UID.
///
/// UIDs are unique per cluster, so every reconciliation of the same pod
/// targets the same record and create-or-update needs no secondary index.
pub fn result_name(uid: &str) -> String {
    format!("{}{}", RESULT_NAME_PREFIX, uid)
}

/// Namespace/name identity of a pod, used as the work queue key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub namespace: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl InstancePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstancePhase::Pending => "Pending",
            InstancePhase::Running => "Running",
            InstancePhase::Succeeded => "Succeeded",
            InstancePhase::Failed => "Failed",
            InstancePhase::Unknown => "Unknown",
        }
    }
}

impl From<&str> for InstancePhase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => InstancePhase::Pending,
            "Running" => InstancePhase::Running,
            "Succeeded" => InstancePhase::Succeeded,
            "Failed" => InstancePhase::Failed,
            _ => InstancePhase::Unknown,
        }
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running unit of a workload (a pod), as seen by the observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub creation_timestamp: DateTime<Utc>,
    /// Empty until the pod is scheduled
    pub node_name: String,
    pub phase: InstancePhase,
    pub reason: String,
    pub message: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl WorkloadInstance {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.namespace, &self.name)
    }

    /// Annotation value, or empty when absent
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn start_ts(&self) -> &str {
        self.annotation(START_TS_ANNOTATION)
    }

    pub fn dp_ready_ts(&self) -> &str {
        self.annotation(DP_READY_TS_ANNOTATION)
    }
}

/// Reference back to the pod a record was derived from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

/// Timestamps captured for a pod, as RFC 3339 text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    pub created_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_ts: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dp_ready_ts: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Latencies derived from the timestamps, in milliseconds since creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMetrics {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub lat_start_ms: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub lat_dp_ready_ms: i64,
}

/// Spec of a `DatapathResult` custom resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapathResultSpec {
    pub pod_ref: PodRef,
    pub timestamps: Timestamps,
    pub metrics: LatencyMetrics,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Durable per-pod record of startup timestamps and latencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathResult {
    pub namespace: String,
    pub name: String,
    /// Opaque store version used for conditional updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    pub spec: DatapathResultSpec,
}

impl DatapathResult {
    /// Label set used for store-side equality filtering
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.spec.labels
    }
}

/// Latency metric served by the query endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyMetric {
    TimeToStart,
    TimeToDatapathReady,
}

impl LatencyMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyMetric::TimeToStart => "time-to-start",
            LatencyMetric::TimeToDatapathReady => "time-to-datapath-ready",
        }
    }

    /// Source timestamp of the metric on a record
    pub fn timestamp<'a>(&self, spec: &'a DatapathResultSpec) -> &'a str {
        match self {
            LatencyMetric::TimeToStart => &spec.timestamps.start_ts,
            LatencyMetric::TimeToDatapathReady => &spec.timestamps.dp_ready_ts,
        }
    }

    /// Derived value of the metric on a record
    pub fn value(&self, spec: &DatapathResultSpec) -> i64 {
        match self {
            LatencyMetric::TimeToStart => spec.metrics.lat_start_ms,
            LatencyMetric::TimeToDatapathReady => spec.metrics.lat_dp_ready_ms,
        }
    }
}

impl fmt::Display for LatencyMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated latency over the matching records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub metric: String,
    pub unit: String,
    pub count: usize,
    pub total_successful: usize,
    pub total_failed: usize,
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
    pub worst_pods: Vec<WorstPod>,
    pub failed_pods: Vec<FailedPod>,
}

/// A successful measurement, ranked by latency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorstPod {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub measured_ts: String,
    pub value: i64,
}

/// A record with no usable measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPod {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

/// Phase tally over live pods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodHealthResult {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label_selector: String,
    pub desired_replicas: usize,
    pub running_pods: usize,
    pub pending_pods: usize,
    pub failed_pods: usize,
    pub success_pct: f64,
    pub pending_pod_list: Vec<PodDetails>,
    pub failed_pod_list: Vec<PodDetails>,
}

/// Detail row for a pod that is not running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDetails {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl From<&WorkloadInstance> for PodDetails {
    fn from(instance: &WorkloadInstance) -> Self {
        Self {
            namespace: instance.namespace.clone(),
            name: instance.name.clone(),
            uid: instance.uid.clone(),
            node_name: instance.node_name.clone(),
            phase: instance.phase.to_string(),
            reason: instance.reason.clone(),
            message: instance.message.clone(),
        }
    }
}
