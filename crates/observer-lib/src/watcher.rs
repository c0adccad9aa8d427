//! Pod lifecycle events and the admission filter in front of the work queue
//!
//! The platform watch stream reports objects as applied, deleted or a full
//! relist. `EventTranslator` turns that into created/updated/deleted events by
//! remembering the last version of each pod, and `EventFilter` decides which
//! events are worth a reconciliation.

use crate::health::{components, HealthRegistry};
use crate::models::{InstanceKey, WorkloadInstance};
use crate::selector::LabelSelector;
use crate::store::{instance_from_pod, ListFilter};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::Api;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// A pod lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    Created(WorkloadInstance),
    Updated {
        old: WorkloadInstance,
        new: WorkloadInstance,
    },
    Deleted(WorkloadInstance),
}

impl InstanceEvent {
    /// The most recent version of the pod carried by the event
    pub fn instance(&self) -> &WorkloadInstance {
        match self {
            InstanceEvent::Created(i) | InstanceEvent::Deleted(i) => i,
            InstanceEvent::Updated { new, .. } => new,
        }
    }
}

/// Raw notification from a watch stream
#[derive(Debug, Clone)]
pub enum WatchUpdate {
    Applied(WorkloadInstance),
    Deleted(WorkloadInstance),
    /// Full relist of every object in scope
    Restarted(Vec<WorkloadInstance>),
}

impl From<watcher::Event<Pod>> for WatchUpdate {
    fn from(event: watcher::Event<Pod>) -> Self {
        match event {
            watcher::Event::Applied(pod) => WatchUpdate::Applied(instance_from_pod(&pod)),
            watcher::Event::Deleted(pod) => WatchUpdate::Deleted(instance_from_pod(&pod)),
            watcher::Event::Restarted(pods) => {
                WatchUpdate::Restarted(pods.iter().map(instance_from_pod).collect())
            }
        }
    }
}

/// Turns watch notifications into lifecycle events
#[derive(Debug, Default)]
pub struct EventTranslator {
    known: HashMap<InstanceKey, WorkloadInstance>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, instance: WorkloadInstance) -> InstanceEvent {
        match self.known.insert(instance.key(), instance.clone()) {
            Some(old) => InstanceEvent::Updated { old, new: instance },
            None => InstanceEvent::Created(instance),
        }
    }

    pub fn translate(&mut self, update: WatchUpdate) -> Vec<InstanceEvent> {
        match update {
            WatchUpdate::Applied(instance) => vec![self.apply(instance)],
            WatchUpdate::Deleted(instance) => {
                self.known.remove(&instance.key());
                vec![InstanceEvent::Deleted(instance)]
            }
            WatchUpdate::Restarted(instances) => {
                let listed: HashSet<InstanceKey> = instances.iter().map(|i| i.key()).collect();
                let vanished: Vec<InstanceKey> = self
                    .known
                    .keys()
                    .filter(|key| !listed.contains(key))
                    .cloned()
                    .collect();

                let mut events: Vec<InstanceEvent> = vanished
                    .into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(InstanceEvent::Deleted)
                    .collect();
                events.extend(instances.into_iter().map(|i| self.apply(i)));
                events
            }
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// True when an update carries something the reconciler cares about:
/// either timestamp annotation changed, or the pod got (re)assigned a node
pub fn has_relevant_change(old: &WorkloadInstance, new: &WorkloadInstance) -> bool {
    old.start_ts() != new.start_ts()
        || old.dp_ready_ts() != new.dp_ready_ts()
        || old.node_name != new.node_name
}

/// Admission predicate for lifecycle events
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    scope: ListFilter,
}

impl EventFilter {
    pub fn new(namespace: Option<String>, labels: LabelSelector) -> Self {
        Self {
            scope: ListFilter::new(namespace, labels),
        }
    }

    fn in_scope(&self, instance: &WorkloadInstance) -> bool {
        self.scope.matches(&instance.namespace, &instance.labels)
    }

    /// Deletions are never admitted: records outlive their pods.
    pub fn admit(&self, event: &InstanceEvent) -> bool {
        match event {
            InstanceEvent::Created(instance) => self.in_scope(instance),
            InstanceEvent::Updated { old, new } => {
                self.in_scope(new) && has_relevant_change(old, new)
            }
            InstanceEvent::Deleted(_) => false,
        }
    }
}

/// Forward pod watch events into `events_tx` until shutdown.
///
/// The first relist marks the controller as synced. Stream errors degrade the
/// watcher component; the stream itself backs off and reconnects.
pub async fn run_pod_watch(
    api: Api<Pod>,
    labels: LabelSelector,
    events_tx: mpsc::Sender<InstanceEvent>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut config = watcher::Config::default();
    if !labels.is_empty() {
        config = config.labels(&labels.to_string());
    }

    let mut stream = Box::pin(watcher(api, config).default_backoff());
    let mut translator = EventTranslator::new();
    info!(selector = %labels, "Starting pod watch");

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    let relisted = matches!(event, watcher::Event::Restarted(_));
                    for event in translator.translate(WatchUpdate::from(event)) {
                        if events_tx.send(event).await.is_err() {
                            debug!("Event receiver closed, stopping pod watch");
                            return;
                        }
                    }
                    if relisted {
                        info!(pods = translator.len(), "Pod watch synced");
                        health.set_synced(true).await;
                        health.set_healthy(components::POD_WATCHER).await;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Pod watch error");
                    health
                        .set_degraded(components::POD_WATCHER, e.to_string())
                        .await;
                }
                None => {
                    warn!("Pod watch stream ended");
                    health
                        .set_unhealthy(components::POD_WATCHER, "watch stream ended")
                        .await;
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!("Shutting down pod watch");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstancePhase, DP_READY_TS_ANNOTATION, START_TS_ANNOTATION};
    use std::collections::BTreeMap;

    fn pod(namespace: &str, name: &str, app: &str) -> WorkloadInstance {
        WorkloadInstance {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: format!("uid-{}", name),
            creation_timestamp: "2025-03-01T12:00:00Z".parse().unwrap(),
            node_name: String::new(),
            phase: InstancePhase::Pending,
            reason: String::new(),
            message: String::new(),
            labels: BTreeMap::from([("app".to_string(), app.to_string())]),
            annotations: BTreeMap::new(),
        }
    }

    fn updated(old: &WorkloadInstance, change: impl FnOnce(&mut WorkloadInstance)) -> InstanceEvent {
        let mut new = old.clone();
        change(&mut new);
        InstanceEvent::Updated {
            old: old.clone(),
            new,
        }
    }

    #[test]
    fn test_status_only_update_is_dropped() {
        let filter = EventFilter::default();
        let old = pod("perf", "a", "sut");
        let event = updated(&old, |p| {
            p.phase = InstancePhase::Running;
            p.message = "started".to_string();
        });
        assert!(!filter.admit(&event));
    }

    #[test]
    fn test_start_ts_flip_is_admitted() {
        let filter = EventFilter::default();
        let old = pod("perf", "a", "sut");
        let event = updated(&old, |p| {
            p.annotations
                .insert(START_TS_ANNOTATION.to_string(), "2025-03-01T12:00:01Z".to_string());
        });
        assert!(filter.admit(&event));
    }

    #[test]
    fn test_dp_ready_and_node_changes_are_admitted() {
        let filter = EventFilter::default();
        let old = pod("perf", "a", "sut");

        let dp = updated(&old, |p| {
            p.annotations
                .insert(DP_READY_TS_ANNOTATION.to_string(), "2025-03-01T12:00:03Z".to_string());
        });
        assert!(filter.admit(&dp));

        let scheduled = updated(&old, |p| p.node_name = "node-1".to_string());
        assert!(filter.admit(&scheduled));
    }

    #[test]
    fn test_namespace_and_labels_gate_all_events() {
        let filter = EventFilter::new(Some("perf".to_string()), LabelSelector::parse("app=sut"));

        assert!(filter.admit(&InstanceEvent::Created(pod("perf", "a", "sut"))));
        assert!(!filter.admit(&InstanceEvent::Created(pod("other", "a", "sut"))));
        assert!(!filter.admit(&InstanceEvent::Created(pod("perf", "a", "client"))));

        let foreign = pod("perf", "b", "client");
        let event = updated(&foreign, |p| p.node_name = "node-1".to_string());
        assert!(!filter.admit(&event));
    }

    #[test]
    fn test_deletes_never_admitted() {
        let filter = EventFilter::default();
        assert!(!filter.admit(&InstanceEvent::Deleted(pod("perf", "a", "sut"))));
    }

    #[test]
    fn test_translator_distinguishes_create_and_update() {
        let mut translator = EventTranslator::new();
        let first = pod("perf", "a", "sut");

        let events = translator.translate(WatchUpdate::Applied(first.clone()));
        assert_eq!(events, vec![InstanceEvent::Created(first.clone())]);

        let mut second = first.clone();
        second.node_name = "node-1".to_string();
        let events = translator.translate(WatchUpdate::Applied(second.clone()));
        assert_eq!(
            events,
            vec![InstanceEvent::Updated {
                old: first,
                new: second
            }]
        );
    }

    #[test]
    fn test_translator_relist_emits_deletes_for_vanished_pods() {
        let mut translator = EventTranslator::new();
        let a = pod("perf", "a", "sut");
        let b = pod("perf", "b", "sut");
        translator.translate(WatchUpdate::Applied(a.clone()));
        translator.translate(WatchUpdate::Applied(b.clone()));

        let events = translator.translate(WatchUpdate::Restarted(vec![a.clone()]));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], InstanceEvent::Deleted(b));
        assert!(matches!(events[1], InstanceEvent::Updated { .. }));
        assert_eq!(translator.len(), 1);
    }

    #[test]
    fn test_translator_delete_forgets_pod() {
        let mut translator = EventTranslator::new();
        let a = pod("perf", "a", "sut");
        translator.translate(WatchUpdate::Applied(a.clone()));
        translator.translate(WatchUpdate::Deleted(a.clone()));
        assert!(translator.is_empty());

        let events = translator.translate(WatchUpdate::Applied(a.clone()));
        assert_eq!(events, vec![InstanceEvent::Created(a)]);
    }
}
