//! Per-pod reconciliation into `DatapathResult` records
//!
//! Records are keyed by pod UID, so repeated reconciliation of one pod always
//! targets the same record. Creation races surface as `AlreadyExists` and
//! update races as `Conflict`; both are answered with a requeue, after which
//! the next pass re-reads the record and applies only what is still missing.

use crate::models::{
    format_timestamp, parse_timestamp, result_name, DatapathResult, DatapathResultSpec,
    InstanceKey, PodRef, Timestamps, WorkloadInstance,
};
use crate::observability::StructuredLogger;
use crate::store::{InstanceApi, ResultStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// How captured timestamps react to later observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampPolicy {
    /// Once a timestamp is set it never changes
    #[default]
    FirstWriteWins,
    /// A changed, non-empty annotation replaces the stored timestamp
    OverwriteOnChange,
}

impl TimestampPolicy {
    fn should_write(&self, current: &str, observed: &str) -> bool {
        if observed.is_empty() {
            return false;
        }
        match self {
            TimestampPolicy::FirstWriteWins => current.is_empty(),
            TimestampPolicy::OverwriteOnChange => current != observed,
        }
    }
}

impl FromStr for TimestampPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "first-write-wins" => Ok(TimestampPolicy::FirstWriteWins),
            "overwrite-on-change" => Ok(TimestampPolicy::OverwriteOnChange),
            other => Err(format!("unknown timestamp policy: {}", other)),
        }
    }
}

/// What the reconciler read off a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub created_at: DateTime<Utc>,
    pub node_name: String,
    pub start_ts: String,
    pub dp_ready_ts: String,
}

impl From<&WorkloadInstance> for Observation {
    fn from(instance: &WorkloadInstance) -> Self {
        Self {
            created_at: instance.creation_timestamp,
            node_name: instance.node_name.clone(),
            start_ts: instance.start_ts().to_string(),
            dp_ready_ts: instance.dp_ready_ts().to_string(),
        }
    }
}

/// Milliseconds from `created_at` to the timestamp in `raw`, if it parses
pub fn latency_ms(created_at: DateTime<Utc>, raw: &str) -> Option<i64> {
    parse_timestamp(raw).map(|ts| (ts - created_at).num_milliseconds())
}

fn recompute(created_at: DateTime<Utc>, raw: &str, field: &str) -> i64 {
    latency_ms(created_at, raw).unwrap_or_else(|| {
        warn!(field, value = %raw, "Unparseable timestamp, latency left unset");
        0
    })
}

/// Fold an observation into a record spec.
///
/// The node name is only filled in once. Each timestamp is written according
/// to `policy`, and only a metric whose source timestamp was written is
/// recomputed. Returns true when anything changed.
pub fn apply_observation(
    spec: &mut DatapathResultSpec,
    observation: &Observation,
    policy: TimestampPolicy,
) -> bool {
    let mut changed = false;

    if spec.pod_ref.node_name.is_empty() && !observation.node_name.is_empty() {
        spec.pod_ref.node_name = observation.node_name.clone();
        changed = true;
    }

    if policy.should_write(&spec.timestamps.start_ts, &observation.start_ts) {
        spec.timestamps.start_ts = observation.start_ts.clone();
        spec.metrics.lat_start_ms =
            recompute(observation.created_at, &observation.start_ts, "startTs");
        changed = true;
    }

    if policy.should_write(&spec.timestamps.dp_ready_ts, &observation.dp_ready_ts) {
        spec.timestamps.dp_ready_ts = observation.dp_ready_ts.clone();
        spec.metrics.lat_dp_ready_ms =
            recompute(observation.created_at, &observation.dp_ready_ts, "dpReadyTs");
        changed = true;
    }

    changed
}

/// A fresh record for a pod, with whatever the pod currently carries applied
pub fn new_record(instance: &WorkloadInstance, policy: TimestampPolicy) -> DatapathResult {
    let mut spec = DatapathResultSpec {
        pod_ref: PodRef {
            namespace: instance.namespace.clone(),
            name: instance.name.clone(),
            uid: instance.uid.clone(),
            node_name: String::new(),
        },
        timestamps: Timestamps {
            created_at: format_timestamp(instance.creation_timestamp),
            ..Default::default()
        },
        metrics: Default::default(),
        labels: instance.labels.clone(),
    };
    apply_observation(&mut spec, &Observation::from(instance), policy);

    DatapathResult {
        namespace: instance.namespace.clone(),
        name: result_name(&instance.uid),
        resource_version: None,
        spec,
    }
}

/// What the controller should do with the key after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Done,
    /// Lost a race with a concurrent writer; run again right away
    Requeue,
}

/// Failure the controller should retry with backoff
#[derive(Debug, thiserror::Error)]
#[error("reconcile {key}: {source}")]
pub struct ReconcileError {
    pub key: InstanceKey,
    #[source]
    pub source: StoreError,
}

/// Reconciles pods into derived records
pub struct Reconciler {
    instances: Arc<dyn InstanceApi>,
    results: Arc<dyn ResultStore>,
    policy: TimestampPolicy,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        instances: Arc<dyn InstanceApi>,
        results: Arc<dyn ResultStore>,
        policy: TimestampPolicy,
    ) -> Self {
        Self {
            instances,
            results,
            policy,
            logger: StructuredLogger::new("reconciler"),
        }
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }

    pub async fn reconcile(&self, key: &InstanceKey) -> Result<ReconcileAction, ReconcileError> {
        let fail = |source: StoreError| ReconcileError {
            key: key.clone(),
            source,
        };

        let instance = match self.instances.get(key).await {
            Ok(instance) => instance,
            Err(StoreError::NotFound(_)) => {
                debug!(pod = %key, "Pod gone, nothing to reconcile");
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(fail(e)),
        };

        let name = result_name(&instance.uid);
        let mut record = match self.results.get(&instance.namespace, &name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                let record = new_record(&instance, self.policy);
                return match self.results.create(record).await {
                    Ok(created) => {
                        self.logger.log_record_created(&created);
                        Ok(ReconcileAction::Done)
                    }
                    Err(StoreError::AlreadyExists(_)) => {
                        debug!(pod = %key, record = %name, "Record created concurrently, requeueing");
                        Ok(ReconcileAction::Requeue)
                    }
                    Err(e) => Err(fail(e)),
                };
            }
            Err(e) => return Err(fail(e)),
        };

        if !apply_observation(&mut record.spec, &Observation::from(&instance), self.policy) {
            debug!(pod = %key, record = %name, "Record up to date");
            return Ok(ReconcileAction::Done);
        }

        match self.results.update(record).await {
            Ok(updated) => {
                self.logger.log_record_updated(&updated);
                Ok(ReconcileAction::Done)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(pod = %key, record = %name, "Record modified concurrently, requeueing");
                Ok(ReconcileAction::Requeue)
            }
            Err(e) => Err(fail(e)),
        }
    }
}
