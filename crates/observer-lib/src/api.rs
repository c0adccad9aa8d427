//! HTTP query API, health checks and Prometheus metrics

use crate::aggregate::{AggregateError, AggregateQuery, HealthAggregator, MetricsAggregator, DEFAULT_TOP_N};
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::LatencyMetric;
use crate::observability::ObserverMetrics;
use crate::selector::LabelSelector;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub metrics_aggregator: MetricsAggregator,
    pub health_aggregator: HealthAggregator,
    pub health_registry: HealthRegistry,
    pub metrics: ObserverMetrics,
}

impl AppState {
    pub fn new(
        metrics_aggregator: MetricsAggregator,
        health_aggregator: HealthAggregator,
        health_registry: HealthRegistry,
        metrics: ObserverMetrics,
    ) -> Self {
        Self {
            metrics_aggregator,
            health_aggregator,
            health_registry,
            metrics,
        }
    }
}

/// Raw query-string parameters shared by the aggregate endpoints
#[derive(Debug, Default)]
pub struct QueryParams {
    pub namespace: Option<String>,
    pub top_n: Option<String>,
    pub label_selector: Option<String>,
}

impl QueryParams {
    /// Collect from raw query pairs. The first occurrence of a key wins and
    /// unknown keys are ignored.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "namespace" => &mut params.namespace,
                "topN" => &mut params.top_n,
                "labelSelector" => &mut params.label_selector,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        params
    }

    /// Lenient conversion: a `topN` that is not a positive integer keeps the
    /// default, and malformed selector pairs are dropped.
    pub fn to_query(&self) -> AggregateQuery {
        let top_n = self
            .top_n
            .as_deref()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_TOP_N);

        AggregateQuery::new(
            self.namespace.clone(),
            self.label_selector
                .as_deref()
                .map(LabelSelector::parse)
                .unwrap_or_default(),
            top_n,
        )
    }
}

/// Aggregator failure rendered as a plain-text 500
pub struct ApiError(AggregateError);

impl From<AggregateError> for ApiError {
    fn from(e: AggregateError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

async fn latency(
    state: &AppState,
    metric: LatencyMetric,
    params: QueryParams,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let result = state
        .metrics_aggregator
        .aggregate(metric, &params.to_query())
        .await;
    state
        .metrics
        .observe_query_latency(metric.as_str(), start.elapsed().as_secs_f64());

    match result {
        Ok(result) => Ok(Json(result).into_response()),
        Err(e) => {
            warn!(endpoint = metric.as_str(), error = %e, "Query failed");
            Err(e.into())
        }
    }
}

async fn time_to_start(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    latency(&state, LatencyMetric::TimeToStart, QueryParams::from_pairs(pairs)).await
}

async fn time_to_datapath_ready(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    latency(
        &state,
        LatencyMetric::TimeToDatapathReady,
        QueryParams::from_pairs(pairs),
    )
    .await
}

async fn pod_health(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let params = QueryParams::from_pairs(pairs);
    let start = Instant::now();
    let result = state.health_aggregator.pod_health(&params.to_query()).await;
    state
        .metrics
        .observe_query_latency("pod-health", start.elapsed().as_secs_f64());

    match result {
        Ok(result) => Ok(Json(result).into_response()),
        Err(e) => {
            warn!(endpoint = "pod-health", error = %e, "Query failed");
            Err(e.into())
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still serving
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/time-to-start", get(time_to_start))
        .route("/api/v1/time-to-datapath-ready", get(time_to_datapath_ready))
        .route("/api/v1/pod-health", get(pod_health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let health = state.health_registry.clone();
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    health.set_healthy(components::QUERY_SERVER).await;
    axum::serve(listener, app).await?;

    Ok(())
}
