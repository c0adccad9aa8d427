//! Observability infrastructure for the datapath observer
//!
//! Provides:
//! - Prometheus metrics (reconcile outcomes and latency, queue depth, watch
//!   event admission, query latency)
//! - Structured JSON logging of domain events with tracing

use crate::models::{format_timestamp, DatapathResult, InstanceKey};
use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Histogram, HistogramVec, IntCounterVec, IntGauge,
};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for reconcile latency (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Histogram buckets for query latency (in seconds)
const QUERY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ObserverMetricsInner> = OnceLock::new();

struct ObserverMetricsInner {
    reconcile_total: IntCounterVec,
    reconcile_duration_seconds: Histogram,
    queue_depth: IntGauge,
    watch_events_total: IntCounterVec,
    query_duration_seconds: HistogramVec,
}

impl ObserverMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_total: register_int_counter_vec!(
                "datapath_observer_reconcile_total",
                "Reconciliations by outcome",
                &["outcome"]
            )
            .expect("Failed to register reconcile_total"),

            reconcile_duration_seconds: register_histogram!(
                "datapath_observer_reconcile_duration_seconds",
                "Time spent reconciling a single pod",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            queue_depth: register_int_gauge!(
                "datapath_observer_queue_depth",
                "Pods waiting in the reconcile queue"
            )
            .expect("Failed to register queue_depth"),

            watch_events_total: register_int_counter_vec!(
                "datapath_observer_watch_events_total",
                "Pod watch events by admission decision",
                &["decision"]
            )
            .expect("Failed to register watch_events_total"),

            query_duration_seconds: register_histogram_vec!(
                "datapath_observer_query_duration_seconds",
                "Time spent computing a query response",
                &["endpoint"],
                QUERY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_duration_seconds"),
        }
    }
}

/// Observer metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct ObserverMetrics {
    _private: (),
}

impl Default for ObserverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ObserverMetricsInner {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new)
    }

    /// Count a reconcile outcome (`done`, `requeue`, `error`)
    pub fn inc_reconcile(&self, outcome: &str) {
        self.inner()
            .reconcile_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn observe_reconcile_latency(&self, duration_secs: f64) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.inner().queue_depth.set(depth);
    }

    /// Count a watch event as `admitted` or `dropped`
    pub fn inc_watch_event(&self, admitted: bool) {
        let decision = if admitted { "admitted" } else { "dropped" };
        self.inner()
            .watch_events_total
            .with_label_values(&[decision])
            .inc();
    }

    pub fn observe_query_latency(&self, endpoint: &str, duration_secs: f64) {
        self.inner()
            .query_duration_seconds
            .with_label_values(&[endpoint])
            .observe(duration_secs);
    }
}

/// Structured logger for observer events
///
/// Emits consistent JSON-formatted events for record lifecycle, reporter
/// progress and process lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    source: String,
}

impl StructuredLogger {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "observer_started",
            source = %self.source,
            version = %version,
            "Datapath observer started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "observer_shutdown",
            source = %self.source,
            reason = %reason,
            "Datapath observer shutting down"
        );
    }

    /// Log the reporter's probe result and measured latency
    pub fn log_probe_succeeded(&self, start_ts: DateTime<Utc>, dp_ready_ts: DateTime<Utc>) {
        info!(
            event = "probe_succeeded",
            source = %self.source,
            start_ts = %format_timestamp(start_ts),
            dp_ready_ts = %format_timestamp(dp_ready_ts),
            latency_ms = (dp_ready_ts - start_ts).num_milliseconds(),
            "Datapath ready"
        );
    }

    pub fn log_annotations_patched(&self, annotations: &BTreeMap<String, String>) {
        info!(
            event = "annotations_patched",
            source = %self.source,
            keys = ?annotations.keys().collect::<Vec<_>>(),
            "Patched pod annotations"
        );
    }

    pub fn log_record_created(&self, record: &DatapathResult) {
        info!(
            event = "record_created",
            source = %self.source,
            namespace = %record.namespace,
            record = %record.name,
            pod = %record.spec.pod_ref.name,
            lat_start_ms = record.spec.metrics.lat_start_ms,
            lat_dp_ready_ms = record.spec.metrics.lat_dp_ready_ms,
            "Created datapath result"
        );
    }

    pub fn log_record_updated(&self, record: &DatapathResult) {
        info!(
            event = "record_updated",
            source = %self.source,
            namespace = %record.namespace,
            record = %record.name,
            node = %record.spec.pod_ref.node_name,
            lat_start_ms = record.spec.metrics.lat_start_ms,
            lat_dp_ready_ms = record.spec.metrics.lat_dp_ready_ms,
            "Updated datapath result"
        );
    }

    pub fn log_reconcile_failed(&self, key: &InstanceKey, error: &str, retry_in_ms: u64) {
        warn!(
            event = "reconcile_failed",
            source = %self.source,
            pod = %key,
            error = %error,
            retry_in_ms = retry_in_ms,
            "Reconcile failed, backing off"
        );
    }
}
