//! Prometheus text exposition endpoint.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use tracing::error;

use crate::kernel::metrics::Metrics;

pub async fn metrics_handler(Extension(metrics): Extension<Arc<Metrics>>) -> (StatusCode, String) {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding failed".to_string(),
            )
        }
    }
}
