// =============================================================================
// Status API — Axum 0.7
// =============================================================================
//
// `/metrics` serves the Prometheus text exposition; everything else lives
// under `/api/v1/`. CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::market_hours;
use crate::metrics::MetricsRegistry;
use crate::provider::ProviderFacade;
use crate::state::CollectorState;

/// Shared handles behind every endpoint.
#[derive(Clone)]
pub struct ApiState {
    pub collector: Arc<CollectorState>,
    pub registry: Arc<MetricsRegistry>,
    pub provider: Arc<ProviderFacade>,
}

/// Build the full router with CORS middleware and shared state.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/metrics", get(metrics))
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/diagnostics", get(diagnostics))
        .route("/api/v1/events", get(events))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.registry.render(),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    market_open: bool,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        market_open: market_hours::is_open(),
        state_version: state.collector.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state
        .collector
        .build_snapshot(market_hours::is_open(), Some(state.provider.diagnostics()));
    Json(snapshot)
}

async fn diagnostics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.provider.diagnostics())
}

async fn events(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.collector.recent_events.read().clone())
}
