//! Health tracking for the controller process
//!
//! Components (pod watcher, reconciler, query server) report their state
//! here; `/healthz` and `/readyz` are answered from the registry. The
//! controller is ready once the initial pod list has been observed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational with problems, e.g. a watch stream reconnecting
    Degraded,
    Unhealthy,
}

/// Latest reported state of a component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let statuses: Vec<ComponentStatus> = components.values().map(|c| c.status).collect();
        if statuses.contains(&ComponentStatus::Unhealthy) {
            ComponentStatus::Unhealthy
        } else if statuses.contains(&ComponentStatus::Degraded) {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const POD_WATCHER: &str = "pod_watcher";
    pub const RECONCILER: &str = "reconciler";
    pub const QUERY_SERVER: &str = "query_server";
}

/// Shared registry of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    synced: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Record whether the initial pod list has been observed
    pub async fn set_synced(&self, synced: bool) {
        *self.synced.write().await = synced;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let synced = *self.synced.read().await;
        let health = self.health().await;

        let reason = if !synced {
            Some("Pod watch not yet synced".to_string())
        } else if health.status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_watcher_degrades_overall() {
        let registry = HealthRegistry::new();
        registry.register(components::POD_WATCHER).await;
        registry.register(components::RECONCILER).await;

        registry
            .set_degraded(components::POD_WATCHER, "watch stream restarting")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::POD_WATCHER].message.as_deref(),
            Some("watch stream restarting")
        );
    }

    #[tokio::test]
    async fn test_unhealthy_wins_over_degraded() {
        let registry = HealthRegistry::new();
        registry.set_degraded(components::POD_WATCHER, "slow").await;
        registry.set_unhealthy(components::QUERY_SERVER, "bind failed").await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_not_ready_until_synced() {
        let registry = HealthRegistry::new();
        registry.register(components::POD_WATCHER).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Pod watch not yet synced"));

        registry.set_synced(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_not_ready_when_unhealthy() {
        let registry = HealthRegistry::new();
        registry.set_synced(true).await;
        registry.set_unhealthy(components::RECONCILER, "store unreachable").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
    }
}
