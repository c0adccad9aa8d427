//! Phase tally over live pods

use super::{AggregateError, AggregateQuery};
use crate::models::{InstancePhase, PodDetails, PodHealthResult, WorkloadInstance};
use crate::store::InstanceApi;
use std::sync::Arc;

/// Tally pod phases. Pods in any phase other than running, pending or
/// failed count toward the total only.
pub fn summarize_pods(
    namespace: &str,
    label_selector: String,
    pods: &[WorkloadInstance],
    top_n: usize,
) -> PodHealthResult {
    let mut running = 0;
    let mut pending = Vec::new();
    let mut failed = Vec::new();

    for pod in pods {
        match pod.phase {
            InstancePhase::Running => running += 1,
            InstancePhase::Pending => pending.push(pod),
            InstancePhase::Failed => failed.push(pod),
            _ => {}
        }
    }

    let total = pods.len();
    let success_pct = if total == 0 {
        0.0
    } else {
        running as f64 / total as f64 * 100.0
    };

    let details = |list: Vec<&WorkloadInstance>| -> Vec<PodDetails> {
        list.into_iter().take(top_n).map(PodDetails::from).collect()
    };

    PodHealthResult {
        namespace: namespace.to_string(),
        label_selector,
        desired_replicas: total,
        running_pods: running,
        pending_pods: pending.len(),
        failed_pods: failed.len(),
        success_pct,
        pending_pod_list: details(pending),
        failed_pod_list: details(failed),
    }
}

/// Computes pod health from the live pod list
#[derive(Clone)]
pub struct HealthAggregator {
    instances: Arc<dyn InstanceApi>,
}

impl HealthAggregator {
    pub fn new(instances: Arc<dyn InstanceApi>) -> Self {
        Self { instances }
    }

    pub async fn pod_health(&self, query: &AggregateQuery) -> Result<PodHealthResult, AggregateError> {
        let mut pods = self
            .instances
            .list(&query.filter())
            .await
            .map_err(|source| AggregateError::List {
                what: "pods",
                source,
            })?;
        pods.sort_by(|a, b| a.key().cmp(&b.key()));

        Ok(summarize_pods(
            query.namespace.as_deref().unwrap_or_default(),
            query.labels.to_string(),
            &pods,
            query.top_n,
        ))
    }
}
