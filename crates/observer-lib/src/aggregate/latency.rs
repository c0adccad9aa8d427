//! Latency percentiles over `DatapathResult` records

use super::{AggregateError, AggregateQuery};
use crate::models::{AggregatedResult, DatapathResult, FailedPod, LatencyMetric, WorstPod};
use crate::store::ResultStore;
use std::sync::Arc;
use tracing::debug;

/// Nearest-rank percentile over ascending samples; 0 for no samples
pub fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((sorted.len() - 1) as f64 * p).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn is_success(metric: LatencyMetric, record: &DatapathResult) -> bool {
    !metric.timestamp(&record.spec).is_empty() && metric.value(&record.spec) > 0
}

fn worst_pod(metric: LatencyMetric, record: &DatapathResult) -> WorstPod {
    let pod = &record.spec.pod_ref;
    WorstPod {
        namespace: pod.namespace.clone(),
        name: pod.name.clone(),
        uid: pod.uid.clone(),
        node_name: pod.node_name.clone(),
        created_at: record.spec.timestamps.created_at.clone(),
        measured_ts: metric.timestamp(&record.spec).to_string(),
        value: metric.value(&record.spec),
    }
}

fn failed_pod(record: &DatapathResult) -> FailedPod {
    let pod = &record.spec.pod_ref;
    FailedPod {
        namespace: pod.namespace.clone(),
        name: pod.name.clone(),
        uid: pod.uid.clone(),
        node_name: pod.node_name.clone(),
    }
}

/// Classify records and compute the aggregate for one metric
pub fn aggregate_records(
    metric: LatencyMetric,
    records: &[DatapathResult],
    top_n: usize,
) -> AggregatedResult {
    let (successes, failures): (Vec<&DatapathResult>, Vec<&DatapathResult>) =
        records.iter().partition(|r| is_success(metric, r));

    let mut samples: Vec<i64> = successes.iter().map(|r| metric.value(&r.spec)).collect();
    samples.sort_unstable();

    let mut worst: Vec<WorstPod> = successes.iter().map(|r| worst_pod(metric, r)).collect();
    worst.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)))
    });
    worst.truncate(top_n);

    let mut failed: Vec<FailedPod> = failures.iter().map(|r| failed_pod(r)).collect();
    failed.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    failed.truncate(top_n);

    AggregatedResult {
        metric: metric.as_str().to_string(),
        unit: "ms".to_string(),
        count: samples.len(),
        total_successful: successes.len(),
        total_failed: failures.len(),
        p50: percentile(&samples, 0.50),
        p90: percentile(&samples, 0.90),
        p99: percentile(&samples, 0.99),
        worst_pods: worst,
        failed_pods: failed,
    }
}

/// Computes latency aggregates from the record store
#[derive(Clone)]
pub struct MetricsAggregator {
    results: Arc<dyn ResultStore>,
}

impl MetricsAggregator {
    pub fn new(results: Arc<dyn ResultStore>) -> Self {
        Self { results }
    }

    pub async fn aggregate(
        &self,
        metric: LatencyMetric,
        query: &AggregateQuery,
    ) -> Result<AggregatedResult, AggregateError> {
        let records = self
            .results
            .list(&query.filter())
            .await
            .map_err(|source| AggregateError::List {
                what: "datapath results",
                source,
            })?;

        debug!(
            metric = %metric,
            records = records.len(),
            selector = %query.labels,
            "Aggregating latency"
        );
        Ok(aggregate_records(metric, &records, query.top_n))
    }
}
