//! Datapath controller
//!
//! Watches pods, reconciles their timing annotations into `DatapathResult`
//! records and serves latency and pod-health aggregates over HTTP.

use anyhow::{Context, Result};
use observer_lib::{
    aggregate::{HealthAggregator, MetricsAggregator},
    api,
    controller::{Controller, Reconciler},
    health::{components, HealthRegistry},
    observability::{ObserverMetrics, StructuredLogger},
    store::{pods_api, KubeInstanceApi, KubeResultStore},
    watcher::{run_pod_watch, EventFilter},
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting datapath-controller");

    let config = config::ObserverConfig::load()?;
    info!(
        namespace = config.namespace().as_deref().unwrap_or("<all>"),
        selector = %config.labels(),
        policy = ?config.timestamp_policy,
        "Controller configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::POD_WATCHER).await;
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::QUERY_SERVER).await;

    let metrics = ObserverMetrics::new();
    let logger = StructuredLogger::new("datapath-controller");
    logger.log_startup(CONTROLLER_VERSION);

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let instances = Arc::new(KubeInstanceApi::new(client.clone()));
    let results = Arc::new(KubeResultStore::new(client.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (events_tx, events_rx) = mpsc::channel(config.queue_capacity.max(1));

    // Pod watch feeding the controller
    let watch_handle = tokio::spawn(run_pod_watch(
        pods_api(client, config.namespace().as_deref()),
        config.labels(),
        events_tx,
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    let controller = Controller::new(
        Reconciler::new(instances.clone(), results.clone(), config.timestamp_policy),
        EventFilter::new(config.namespace(), config.labels()),
        config.controller(),
        health_registry.clone(),
        metrics.clone(),
    );
    let controller_handle = tokio::spawn(controller.run(events_rx, shutdown_tx.subscribe()));

    // Query, health and metrics server
    let app_state = Arc::new(api::AppState::new(
        MetricsAggregator::new(results),
        HealthAggregator::new(instances),
        health_registry.clone(),
        metrics,
    ));
    let api_health = health_registry.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(config.api_port, app_state).await {
            error!(error = %e, "API server failed");
            api_health
                .set_unhealthy(components::QUERY_SERVER, e.to_string())
                .await;
        }
    });

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    let _ = tokio::join!(watch_handle, controller_handle);
    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}
