//! Reconciler and controller loop tests
//!
//! These tests verify:
//! - Record creation and deterministic naming
//! - First-write-wins timestamps under repeated and racing reconciliation
//! - Requeue on create/update races, backoff on store errors

use super::*;
use crate::models::{
    result_name, DatapathResult, InstancePhase, WorkloadInstance, DP_READY_TS_ANNOTATION,
    START_TS_ANNOTATION,
};
use crate::selector::LabelSelector;
use crate::store::{
    InMemoryInstanceApi, InMemoryResultStore, InstanceApi, ListFilter, ResultStore, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const T0: &str = "2025-03-01T12:00:00Z";
const T1: &str = "2025-03-01T12:00:01.5Z";
const T2: &str = "2025-03-01T12:00:02Z";
const T3: &str = "2025-03-01T12:00:03Z";

fn created_at() -> DateTime<Utc> {
    T0.parse().unwrap()
}

fn pod(name: &str, annotations: &[(&str, &str)]) -> WorkloadInstance {
    WorkloadInstance {
        namespace: "perf".to_string(),
        name: name.to_string(),
        uid: format!("uid-{}", name),
        creation_timestamp: created_at(),
        node_name: String::new(),
        phase: InstancePhase::Pending,
        reason: String::new(),
        message: String::new(),
        labels: BTreeMap::from([("app".to_string(), "sut".to_string())]),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

async fn setup(
    instance: WorkloadInstance,
    policy: TimestampPolicy,
) -> (Reconciler, Arc<InMemoryInstanceApi>, Arc<InMemoryResultStore>) {
    let instances = Arc::new(InMemoryInstanceApi::new());
    instances.upsert(instance).await;
    let results = Arc::new(InMemoryResultStore::new());
    let reconciler = Reconciler::new(instances.clone(), results.clone(), policy);
    (reconciler, instances, results)
}

async fn stored(results: &InMemoryResultStore, name: &str) -> DatapathResult {
    results.get("perf", &result_name(&format!("uid-{}", name))).await.unwrap()
}

mod apply_tests {
    use super::*;

    fn observation(node: &str, start: &str, dp: &str) -> Observation {
        Observation {
            created_at: created_at(),
            node_name: node.to_string(),
            start_ts: start.to_string(),
            dp_ready_ts: dp.to_string(),
        }
    }

    #[test]
    fn test_latency_ms() {
        assert_eq!(latency_ms(created_at(), T1), Some(1500));
        assert_eq!(latency_ms(created_at(), "garbage"), None);
    }

    #[test]
    fn test_new_record_has_identity_and_computable_metrics() {
        let instance = pod("a", &[(START_TS_ANNOTATION, T1)]);
        let record = new_record(&instance, TimestampPolicy::FirstWriteWins);

        assert_eq!(record.name, "dpresult-uid-a");
        assert_eq!(record.namespace, "perf");
        assert_eq!(record.spec.pod_ref.uid, "uid-a");
        assert_eq!(record.spec.timestamps.created_at, "2025-03-01T12:00:00.000000000Z");
        assert_eq!(record.spec.timestamps.start_ts, T1);
        assert_eq!(record.spec.timestamps.dp_ready_ts, "");
        assert_eq!(record.spec.metrics.lat_start_ms, 1500);
        assert_eq!(record.spec.metrics.lat_dp_ready_ms, 0);
        assert_eq!(record.spec.labels["app"], "sut");
    }

    #[test]
    fn test_first_write_wins_ignores_later_timestamp() {
        let mut spec = new_record(&pod("a", &[(START_TS_ANNOTATION, T1)]), Default::default()).spec;

        let changed = apply_observation(
            &mut spec,
            &observation("", T2, ""),
            TimestampPolicy::FirstWriteWins,
        );

        assert!(!changed);
        assert_eq!(spec.timestamps.start_ts, T1);
        assert_eq!(spec.metrics.lat_start_ms, 1500);
    }

    #[test]
    fn test_overwrite_policy_replaces_and_recomputes() {
        let mut spec = new_record(&pod("a", &[(START_TS_ANNOTATION, T1)]), Default::default()).spec;

        let changed = apply_observation(
            &mut spec,
            &observation("", T2, ""),
            TimestampPolicy::OverwriteOnChange,
        );

        assert!(changed);
        assert_eq!(spec.timestamps.start_ts, T2);
        assert_eq!(spec.metrics.lat_start_ms, 2000);
    }

    #[test]
    fn test_overwrite_policy_never_clears() {
        let mut spec = new_record(&pod("a", &[(START_TS_ANNOTATION, T1)]), Default::default()).spec;
        let changed = apply_observation(
            &mut spec,
            &observation("", "", ""),
            TimestampPolicy::OverwriteOnChange,
        );
        assert!(!changed);
        assert_eq!(spec.timestamps.start_ts, T1);
    }

    #[test]
    fn test_only_changed_metric_is_recomputed() {
        let mut spec = new_record(&pod("a", &[(START_TS_ANNOTATION, T1)]), Default::default()).spec;
        // Pretend the start latency was computed against some other base
        spec.metrics.lat_start_ms = 42;

        apply_observation(
            &mut spec,
            &observation("", T1, T3),
            TimestampPolicy::FirstWriteWins,
        );

        assert_eq!(spec.metrics.lat_start_ms, 42);
        assert_eq!(spec.metrics.lat_dp_ready_ms, 3000);
    }

    #[test]
    fn test_node_name_set_once() {
        let mut spec = new_record(&pod("a", &[]), Default::default()).spec;

        assert!(apply_observation(&mut spec, &observation("node-1", "", ""), Default::default()));
        assert_eq!(spec.pod_ref.node_name, "node-1");

        assert!(!apply_observation(&mut spec, &observation("node-2", "", ""), Default::default()));
        assert_eq!(spec.pod_ref.node_name, "node-1");
    }

    #[test]
    fn test_unparseable_timestamp_is_stored_without_metric() {
        let mut spec = new_record(&pod("a", &[]), Default::default()).spec;
        assert!(apply_observation(
            &mut spec,
            &observation("", "yesterday", ""),
            Default::default()
        ));
        assert_eq!(spec.timestamps.start_ts, "yesterday");
        assert_eq!(spec.metrics.lat_start_ms, 0);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "first-write-wins".parse::<TimestampPolicy>(),
            Ok(TimestampPolicy::FirstWriteWins)
        );
        assert_eq!(
            "overwrite-on-change".parse::<TimestampPolicy>(),
            Ok(TimestampPolicy::OverwriteOnChange)
        );
        assert!("last-write-wins".parse::<TimestampPolicy>().is_err());
    }
}

mod reconcile_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_pod_is_a_no_op() {
        let instances = Arc::new(InMemoryInstanceApi::new());
        let results = Arc::new(InMemoryResultStore::new());
        let reconciler = Reconciler::new(instances, results.clone(), Default::default());

        let action = reconciler
            .reconcile(&InstanceKey::new("perf", "gone"))
            .await
            .unwrap();

        assert_eq!(action, ReconcileAction::Done);
        assert!(results.is_empty().await);
    }

    #[tokio::test]
    async fn test_repeated_reconcile_targets_one_record() {
        let (reconciler, instances, results) =
            setup(pod("a", &[(START_TS_ANNOTATION, T1)]), Default::default()).await;
        let key = InstanceKey::new("perf", "a");

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileAction::Done);

        let mut later = pod("a", &[(START_TS_ANNOTATION, T1), (DP_READY_TS_ANNOTATION, T3)]);
        later.node_name = "node-1".to_string();
        instances.upsert(later).await;
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileAction::Done);
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileAction::Done);

        assert_eq!(results.len().await, 1);
        let record = stored(&results, "a").await;
        assert_eq!(record.spec.pod_ref.node_name, "node-1");
        assert_eq!(record.spec.metrics.lat_start_ms, 1500);
        assert_eq!(record.spec.metrics.lat_dp_ready_ms, 3000);
    }

    #[tokio::test]
    async fn test_later_start_ts_is_ignored() {
        let (reconciler, instances, results) =
            setup(pod("a", &[(START_TS_ANNOTATION, T1)]), Default::default()).await;
        let key = InstanceKey::new("perf", "a");
        reconciler.reconcile(&key).await.unwrap();
        let before = stored(&results, "a").await;

        instances.upsert(pod("a", &[(START_TS_ANNOTATION, T2)])).await;
        reconciler.reconcile(&key).await.unwrap();

        let after = stored(&results, "a").await;
        assert_eq!(after.spec.timestamps.start_ts, T1);
        assert_eq!(after.spec.metrics.lat_start_ms, 1500);
        // No write happened at all
        assert_eq!(after.resource_version, before.resource_version);
    }

    /// Store that lets a concurrent writer sneak in before the first update
    struct RacingStore {
        inner: InMemoryResultStore,
        concurrent_start_ts: String,
        raced: AtomicUsize,
    }

    #[async_trait]
    impl ResultStore for RacingStore {
        async fn list(&self, filter: &ListFilter) -> Result<Vec<DatapathResult>, StoreError> {
            self.inner.list(filter).await
        }

        async fn get(&self, namespace: &str, name: &str) -> Result<DatapathResult, StoreError> {
            self.inner.get(namespace, name).await
        }

        async fn create(&self, record: DatapathResult) -> Result<DatapathResult, StoreError> {
            self.inner.create(record).await
        }

        async fn update(&self, record: DatapathResult) -> Result<DatapathResult, StoreError> {
            if self.raced.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut theirs = self.inner.get(&record.namespace, &record.name).await?;
                theirs.spec.timestamps.dp_ready_ts = self.concurrent_start_ts.clone();
                theirs.spec.metrics.lat_dp_ready_ms = 2000;
                self.inner.update(theirs).await?;
            }
            self.inner.update(record).await
        }
    }

    #[tokio::test]
    async fn test_update_conflict_requeues_without_clobbering() {
        let instances = Arc::new(InMemoryInstanceApi::new());
        instances.upsert(pod("a", &[])).await;
        let results = Arc::new(RacingStore {
            inner: InMemoryResultStore::new(),
            concurrent_start_ts: T2.to_string(),
            raced: AtomicUsize::new(0),
        });
        let reconciler = Reconciler::new(instances.clone(), results.clone(), Default::default());
        let key = InstanceKey::new("perf", "a");

        reconciler.reconcile(&key).await.unwrap();

        instances.upsert(pod("a", &[(DP_READY_TS_ANNOTATION, T3)])).await;
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileAction::Requeue);

        // The requeued pass sees the concurrently written timestamp and keeps it
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileAction::Done);
        let record = results.get("perf", "dpresult-uid-a").await.unwrap();
        assert_eq!(record.spec.timestamps.dp_ready_ts, T2);
        assert_eq!(record.spec.metrics.lat_dp_ready_ms, 2000);
    }

    /// Store where another reconciler creates the record first
    struct CreateRaceStore {
        inner: InMemoryResultStore,
    }

    #[async_trait]
    impl ResultStore for CreateRaceStore {
        async fn list(&self, filter: &ListFilter) -> Result<Vec<DatapathResult>, StoreError> {
            self.inner.list(filter).await
        }

        async fn get(&self, namespace: &str, name: &str) -> Result<DatapathResult, StoreError> {
            self.inner.get(namespace, name).await
        }

        async fn create(&self, record: DatapathResult) -> Result<DatapathResult, StoreError> {
            let mut theirs = record.clone();
            theirs.spec.timestamps.start_ts = String::new();
            theirs.spec.metrics.lat_start_ms = 0;
            let _ = self.inner.create(theirs).await;
            self.inner.create(record).await
        }

        async fn update(&self, record: DatapathResult) -> Result<DatapathResult, StoreError> {
            self.inner.update(record).await
        }
    }

    #[tokio::test]
    async fn test_already_exists_requeues_then_updates() {
        let instances = Arc::new(InMemoryInstanceApi::new());
        instances.upsert(pod("a", &[(START_TS_ANNOTATION, T1)])).await;
        let results = Arc::new(CreateRaceStore {
            inner: InMemoryResultStore::new(),
        });
        let reconciler = Reconciler::new(instances, results.clone(), Default::default());
        let key = InstanceKey::new("perf", "a");

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileAction::Requeue);
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileAction::Done);

        let record = results.get("perf", "dpresult-uid-a").await.unwrap();
        assert_eq!(record.spec.timestamps.start_ts, T1);
        assert_eq!(record.spec.metrics.lat_start_ms, 1500);
    }

    /// Pod API whose reads fail a fixed number of times
    struct FlakyInstances {
        inner: InMemoryInstanceApi,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl InstanceApi for FlakyInstances {
        async fn get(&self, key: &InstanceKey) -> Result<WorkloadInstance, StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.get(key).await
        }

        async fn list(&self, filter: &ListFilter) -> Result<Vec<WorkloadInstance>, StoreError> {
            self.inner.list(filter).await
        }

        async fn patch_annotations(
            &self,
            key: &InstanceKey,
            annotations: &BTreeMap<String, String>,
        ) -> Result<(), StoreError> {
            self.inner.patch_annotations(key, annotations).await
        }
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let inner = InMemoryInstanceApi::new();
        inner.upsert(pod("a", &[])).await;
        let instances = Arc::new(FlakyInstances {
            inner,
            failures_left: AtomicUsize::new(1),
        });
        let reconciler = Reconciler::new(
            instances,
            Arc::new(InMemoryResultStore::new()),
            Default::default(),
        );

        let err = reconciler
            .reconcile(&InstanceKey::new("perf", "a"))
            .await
            .unwrap_err();
        assert_eq!(err.key, InstanceKey::new("perf", "a"));
        assert!(matches!(err.source, StoreError::Backend(_)));
    }

    mod controller_loop {
        use super::*;
        use crate::health::HealthRegistry;
        use crate::observability::ObserverMetrics;
        use crate::watcher::InstanceEvent;

        async fn wait_for_record(results: &InMemoryResultStore, name: &str) -> DatapathResult {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Ok(record) = results.get("perf", name).await {
                        return record;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("record was never written")
        }

        #[test]
        fn test_backoff_doubles_and_caps() {
            let config = ControllerConfig::default();
            assert_eq!(config.backoff_for(1), Duration::from_millis(100));
            assert_eq!(config.backoff_for(2), Duration::from_millis(200));
            assert_eq!(config.backoff_for(4), Duration::from_millis(800));
            assert_eq!(config.backoff_for(20), Duration::from_secs(60));
            assert_eq!(config.backoff_for(200), Duration::from_secs(60));
        }

        #[tokio::test]
        async fn test_admitted_events_are_reconciled() {
            let instances = Arc::new(InMemoryInstanceApi::new());
            let results = Arc::new(InMemoryResultStore::new());
            let a = pod("a", &[(START_TS_ANNOTATION, T1)]);
            let mut other = pod("b", &[(START_TS_ANNOTATION, T1)]);
            other.labels.insert("app".to_string(), "client".to_string());
            instances.upsert(a.clone()).await;
            instances.upsert(other.clone()).await;

            let controller = Controller::new(
                Reconciler::new(instances.clone(), results.clone(), Default::default()),
                EventFilter::new(Some("perf".to_string()), LabelSelector::parse("app=sut")),
                ControllerConfig::default(),
                HealthRegistry::new(),
                ObserverMetrics::new(),
            );

            let (events_tx, events_rx) = mpsc::channel(16);
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let handle = tokio::spawn(controller.run(events_rx, shutdown_rx));

            events_tx.send(InstanceEvent::Created(other)).await.unwrap();
            events_tx.send(InstanceEvent::Created(a.clone())).await.unwrap();
            let record = wait_for_record(&results, "dpresult-uid-a").await;
            assert_eq!(record.spec.metrics.lat_start_ms, 1500);

            let mut ready = a.clone();
            ready
                .annotations
                .insert(DP_READY_TS_ANNOTATION.to_string(), T3.to_string());
            instances.upsert(ready.clone()).await;
            events_tx
                .send(InstanceEvent::Updated { old: a, new: ready })
                .await
                .unwrap();

            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let record = results.get("perf", "dpresult-uid-a").await.unwrap();
                    if record.spec.metrics.lat_dp_ready_ms == 3000 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("update was never applied");

            shutdown_tx.send(()).unwrap();
            handle.await.unwrap();

            // The pod outside the label selector never got a record
            assert_eq!(results.len().await, 1);
        }

        #[tokio::test]
        async fn test_failing_keys_are_retried_with_backoff() {
            let inner = InMemoryInstanceApi::new();
            let a = pod("a", &[(START_TS_ANNOTATION, T1)]);
            inner.upsert(a.clone()).await;
            let instances = Arc::new(FlakyInstances {
                inner,
                failures_left: AtomicUsize::new(3),
            });
            let results = Arc::new(InMemoryResultStore::new());
            let health = HealthRegistry::new();

            let controller = Controller::new(
                Reconciler::new(instances.clone(), results.clone(), Default::default()),
                EventFilter::default(),
                ControllerConfig {
                    backoff_base: Duration::from_millis(5),
                    ..Default::default()
                },
                health.clone(),
                ObserverMetrics::new(),
            );

            let (events_tx, events_rx) = mpsc::channel(16);
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let handle = tokio::spawn(controller.run(events_rx, shutdown_rx));

            events_tx.send(InstanceEvent::Created(a)).await.unwrap();
            wait_for_record(&results, "dpresult-uid-a").await;
            assert_eq!(instances.failures_left.load(Ordering::SeqCst), 0);

            shutdown_tx.send(()).unwrap();
            handle.await.unwrap();
        }

        /// Pod lookups that take a while and record how many overlap
        struct SlowInstances {
            inner: InMemoryInstanceApi,
            in_flight: AtomicUsize,
            max_in_flight: AtomicUsize,
        }

        #[async_trait]
        impl InstanceApi for SlowInstances {
            async fn get(&self, key: &InstanceKey) -> Result<WorkloadInstance, StoreError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.inner.get(key).await
            }

            async fn list(
                &self,
                filter: &ListFilter,
            ) -> Result<Vec<WorkloadInstance>, StoreError> {
                self.inner.list(filter).await
            }

            async fn patch_annotations(
                &self,
                key: &InstanceKey,
                annotations: &BTreeMap<String, String>,
            ) -> Result<(), StoreError> {
                self.inner.patch_annotations(key, annotations).await
            }
        }

        #[tokio::test]
        async fn test_concurrent_reconciles_are_bounded() {
            let inner = InMemoryInstanceApi::new();
            let pods: Vec<_> = (0..8)
                .map(|i| pod(&format!("p{}", i), &[(START_TS_ANNOTATION, T1)]))
                .collect();
            for p in &pods {
                inner.upsert(p.clone()).await;
            }
            let instances = Arc::new(SlowInstances {
                inner,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            });
            let results = Arc::new(InMemoryResultStore::new());

            let controller = Controller::new(
                Reconciler::new(instances.clone(), results.clone(), Default::default()),
                EventFilter::default(),
                ControllerConfig {
                    max_concurrent_reconciles: 3,
                    ..Default::default()
                },
                HealthRegistry::new(),
                ObserverMetrics::new(),
            );

            let (events_tx, events_rx) = mpsc::channel(16);
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let handle = tokio::spawn(controller.run(events_rx, shutdown_rx));

            for p in pods {
                events_tx.send(InstanceEvent::Created(p)).await.unwrap();
            }
            for i in 0..8 {
                wait_for_record(&results, &format!("dpresult-uid-p{}", i)).await;
            }

            assert_eq!(instances.max_in_flight.load(Ordering::SeqCst), 3);
            assert_eq!(instances.in_flight.load(Ordering::SeqCst), 0);

            shutdown_tx.send(()).unwrap();
            handle.await.unwrap();
        }
    }
}
