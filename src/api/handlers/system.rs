use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::api::state::AppState;
use crate::services::HealthStatus;

/// GET /health -- daemon health with component detail
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.daemon.health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// GET /healthz -- is the process alive?
pub async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}
