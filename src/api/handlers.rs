use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::collections::HashMap;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::repositories::session_cache::CacheHealth;
use crate::schemas::{HealthResponse, RootResponse};

pub(crate) async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let response = RootResponse {
        message: "CBT session engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.settings().runtime().environment.as_str().to_string(),
        live_sessions: state.registry().live_count().await,
    };

    Json(response)
}

pub(crate) async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = state.cache();
    let health = cache.health().await;
    let status = match health {
        CacheHealth::Healthy => "healthy",
        CacheHealth::Unavailable(_) => "degraded",
    };

    let mut components = HashMap::new();
    components.insert(format!("cache:{}", cache.backend()), health.as_status());

    Json(HealthResponse {
        service: "cbt-session".to_string(),
        status: status.to_string(),
        components,
    })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.settings().telemetry().prometheus_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match metrics::render() {
        Some(body) => ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
