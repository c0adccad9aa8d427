//! Bounded reconcile queue
//!
//! Keys already waiting in the queue are coalesced, so a burst of events for
//! one pod results in a single pending reconciliation.

use crate::models::InstanceKey;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Producer side of the queue
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<InstanceKey>,
    pending: Arc<DashSet<InstanceKey>>,
}

/// Consumer side of the queue
#[derive(Debug)]
pub struct WorkReceiver {
    rx: mpsc::Receiver<InstanceKey>,
    pending: Arc<DashSet<InstanceKey>>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> (Self, WorkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(DashSet::new());
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            WorkReceiver { rx, pending },
        )
    }

    /// Enqueue a key, waiting for capacity. Returns false when the key was
    /// already pending or the queue is closed.
    pub async fn enqueue(&self, key: InstanceKey) -> bool {
        if !self.pending.insert(key.clone()) {
            return false;
        }
        if self.tx.send(key.clone()).await.is_err() {
            self.pending.remove(&key);
            return false;
        }
        true
    }

    /// Enqueue a key after `delay` without blocking the caller
    pub fn enqueue_after(&self, key: InstanceKey, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.enqueue(key).await;
        });
    }

    /// Number of keys waiting to be processed
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl WorkReceiver {
    /// Next key to process; `None` once every producer is gone
    pub async fn next(&mut self) -> Option<InstanceKey> {
        let key = self.rx.recv().await?;
        self.pending.remove(&key);
        Some(key)
    }
}
