use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::{routing::get, Router};
use civpds_carstore::CarStore;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub carstore: Arc<CarStore>,
    pub health_timeout: Duration,
}

/// Build the axum router with the node's endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/_health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check: the shard index must answer within the timeout.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let version = env!("CARGO_PKG_VERSION");
    match tokio::time::timeout(state.health_timeout, state.carstore.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({ "version": version }))),
        Ok(Err(e)) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "version": version, "error": "Service Unavailable" })),
            )
        }
        Err(_) => {
            warn!(timeout = ?state.health_timeout, "health check timed out");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "version": version, "error": "Service Unavailable" })),
            )
        }
    }
}
