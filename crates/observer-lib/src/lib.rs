//! Datapath observer library
//!
//! This crate provides the core functionality for:
//! - Probing datapath readiness from inside a pod and annotating the pod
//! - Watching pods and reconciling their annotations into `DatapathResult` records
//! - Aggregating latency percentiles and pod health over those records
//! - Serving the aggregates over HTTP, with health checks and observability

pub mod aggregate;
pub mod api;
pub mod controller;
pub mod health;
pub mod models;
pub mod observability;
pub mod probe;
pub mod reporter;
pub mod selector;
pub mod store;
pub mod watcher;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ObserverMetrics, StructuredLogger};
pub use selector::LabelSelector;
