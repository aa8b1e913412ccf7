//! Route configuration.

use crate::error::EngineResult;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage: &'static str,
    pub metadata: &'static str,
}

/// GET /healthz - liveness of the metadata store.
pub async fn health_check(State(state): State<AppState>) -> EngineResult<Json<HealthResponse>> {
    state.engine.metadata().health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        storage: state.engine.storage().backend_name(),
        metadata: state.config.metadata.driver_name(),
    }))
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
