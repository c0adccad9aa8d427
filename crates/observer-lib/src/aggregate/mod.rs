//! On-demand aggregation over records and live pods
//!
//! Nothing here is cached: every call lists the store afresh, so results
//! always reflect the store at query time.

mod health;
mod latency;

pub use health::HealthAggregator;
pub use latency::{percentile, MetricsAggregator};

use crate::selector::LabelSelector;
use crate::store::{ListFilter, StoreError};

/// Number of detail rows returned when a query does not ask for a count
pub const DEFAULT_TOP_N: usize = 10;

/// Errors surfaced by the aggregators
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("failed to list {what}: {source}")]
    List {
        what: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Filters and limits shared by every aggregate query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateQuery {
    pub namespace: Option<String>,
    pub labels: LabelSelector,
    pub top_n: usize,
}

impl Default for AggregateQuery {
    fn default() -> Self {
        Self {
            namespace: None,
            labels: LabelSelector::default(),
            top_n: DEFAULT_TOP_N,
        }
    }
}

impl AggregateQuery {
    pub fn new(namespace: Option<String>, labels: LabelSelector, top_n: usize) -> Self {
        Self {
            namespace,
            labels,
            top_n,
        }
    }

    pub fn filter(&self) -> ListFilter {
        ListFilter::new(self.namespace.clone(), self.labels.clone())
    }
}
