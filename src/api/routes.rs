use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // System endpoints
        .route("/health", get(handlers::health_handler))
        .route("/healthz", get(handlers::liveness_handler))
        // Run endpoints
        .route("/api/runs", get(handlers::list_runs))
        .route("/api/runs/:id", get(handlers::get_run))
        .route("/api/runs/:id/resume", post(handlers::resume_run))
        // Pod endpoints
        .route("/api/pods/:name/train", post(handlers::train_pod))
        .route("/api/pods/:name/stop", post(handlers::stop_pod))
        .route("/api/pods/:name/export", post(handlers::export_model))
        .route("/api/pods/:name/import", post(handlers::import_model))
        .route("/api/pods/:name/inference", get(handlers::get_inference))
        .route("/api/pods/:name/data", post(handlers::add_data))
        // Add state and CORS
        .with_state(state)
        .layer(cors)
}
