//! Router wiring for the worker's two HTTP listeners.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{StatusCode, Uri};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::kernel::jobs::JobStore;
use crate::kernel::metrics::Metrics;
use crate::kernel::render::RenderPool;
use crate::kernel::storage::BlobStore;

use super::routes::{health, metrics};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub pool: Arc<RenderPool>,
    pub metrics: Arc<Metrics>,
}

/// Router served on `HEALTH_PORT`.
pub fn health_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root_handler))
        .route("/health", get(health::health_handler))
        .fallback(not_found)
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

/// Router served on `METRICS_PORT`.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .fallback(not_found)
        .layer(Extension(metrics))
        .layer(TraceLayer::new_for_http())
}

async fn not_found(uri: Uri) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
            "path": uri.path(),
        })),
    )
}
