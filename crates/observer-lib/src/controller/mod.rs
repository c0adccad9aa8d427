//! Pod-to-record reconciliation controller
//!
//! Lifecycle events pass through the admission filter into a bounded work
//! queue; a dispatcher runs up to `max_concurrent_reconciles` reconciliations
//! at once. Independent pods never coordinate: correctness under overlap comes
//! from the record store's conditional writes.

mod queue;
mod reconciler;

#[cfg(test)]
mod tests;

pub use queue::{WorkQueue, WorkReceiver};
pub use reconciler::{
    apply_observation, latency_ms, new_record, Observation, ReconcileAction, ReconcileError,
    Reconciler, TimestampPolicy,
};

use crate::health::{components, HealthRegistry};
use crate::models::InstanceKey;
use crate::observability::{ObserverMetrics, StructuredLogger};
use crate::watcher::{EventFilter, InstanceEvent};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

/// Configuration for the controller loop
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Reconciliations allowed to run at the same time (default: 10)
    pub max_concurrent_reconciles: usize,
    /// Capacity of the work queue (default: 1024)
    pub queue_capacity: usize,
    /// Delay before the first retry of a failing key (default: 100ms)
    pub backoff_base: Duration,
    /// Upper bound on the retry delay (default: 60 seconds)
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 10,
            queue_capacity: 1024,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    /// Retry delay after `failures` consecutive failures of one key
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// The reconciliation controller
pub struct Controller {
    reconciler: Arc<Reconciler>,
    filter: EventFilter,
    config: ControllerConfig,
    health: HealthRegistry,
    metrics: ObserverMetrics,
    logger: StructuredLogger,
}

impl Controller {
    pub fn new(
        reconciler: Reconciler,
        filter: EventFilter,
        config: ControllerConfig,
        health: HealthRegistry,
        metrics: ObserverMetrics,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            filter,
            config,
            health,
            metrics,
            logger: StructuredLogger::new("controller"),
        }
    }

    /// Consume lifecycle events until shutdown.
    ///
    /// Reconciliations already running when shutdown arrives finish on their
    /// own; nothing new is dispatched.
    pub async fn run(
        self,
        events: mpsc::Receiver<InstanceEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            max_concurrent = self.config.max_concurrent_reconciles,
            queue_capacity = self.config.queue_capacity,
            policy = ?self.reconciler.policy(),
            "Starting reconcile controller"
        );

        let (queue, mut work) = WorkQueue::new(self.config.queue_capacity);
        let admission = tokio::spawn(admit_events(
            events,
            self.filter.clone(),
            queue.clone(),
            self.metrics.clone(),
        ));

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles.max(1)));
        let failures: Arc<DashMap<InstanceKey, u32>> = Arc::new(DashMap::new());

        loop {
            tokio::select! {
                key = work.next() => {
                    let Some(key) = key else { break };
                    self.metrics.set_queue_depth(queue.len() as i64);

                    let permit = tokio::select! {
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = shutdown.recv() => break,
                    };

                    let worker = Worker {
                        reconciler: self.reconciler.clone(),
                        queue: queue.clone(),
                        failures: failures.clone(),
                        config: self.config.clone(),
                        health: self.health.clone(),
                        metrics: self.metrics.clone(),
                        logger: self.logger.clone(),
                    };
                    tokio::spawn(async move {
                        worker.process(key).await;
                        drop(permit);
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        admission.abort();
        info!("Shutting down reconcile controller");
    }
}

/// Filter events and enqueue the admitted ones
async fn admit_events(
    mut events: mpsc::Receiver<InstanceEvent>,
    filter: EventFilter,
    queue: WorkQueue,
    metrics: ObserverMetrics,
) {
    while let Some(event) = events.recv().await {
        let admitted = filter.admit(&event);
        metrics.inc_watch_event(admitted);
        if admitted {
            queue.enqueue(event.instance().key()).await;
            metrics.set_queue_depth(queue.len() as i64);
        }
    }
    debug!("Event stream closed");
}

/// Everything one reconciliation task needs
struct Worker {
    reconciler: Arc<Reconciler>,
    queue: WorkQueue,
    failures: Arc<DashMap<InstanceKey, u32>>,
    config: ControllerConfig,
    health: HealthRegistry,
    metrics: ObserverMetrics,
    logger: StructuredLogger,
}

impl Worker {
    async fn process(self, key: InstanceKey) {
        let start = Instant::now();
        let result = self.reconciler.reconcile(&key).await;
        self.metrics
            .observe_reconcile_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(action) => {
                let recovered = self.failures.remove(&key).is_some();
                if recovered && self.failures.is_empty() {
                    self.health.set_healthy(components::RECONCILER).await;
                }
                match action {
                    ReconcileAction::Done => self.metrics.inc_reconcile("done"),
                    ReconcileAction::Requeue => {
                        self.metrics.inc_reconcile("requeue");
                        self.queue.enqueue_after(key, Duration::ZERO);
                    }
                }
            }
            Err(e) => {
                self.metrics.inc_reconcile("error");
                let failures = {
                    let mut count = self.failures.entry(key.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let delay = self.config.backoff_for(failures);
                self.logger
                    .log_reconcile_failed(&key, &e.to_string(), delay.as_millis() as u64);
                self.health
                    .set_degraded(components::RECONCILER, e.to_string())
                    .await;
                self.queue.enqueue_after(key, delay);
            }
        }
    }
}
