//! Health endpoint aggregating the worker's four probes.

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;

use crate::server::app::AppState;

const DB_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const MEMORY_PRESSURE_THRESHOLD: f64 = 0.8;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
    checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    database: CheckResult,
    storage: CheckResult,
    render: CheckResult,
    memory: MemoryCheck,
}

#[derive(Serialize)]
pub struct CheckResult {
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct MemoryCheck {
    healthy: bool,
    message: String,
}

#[derive(Serialize)]
pub struct ServiceInfo {
    service: &'static str,
    status: &'static str,
    timestamp: DateTime<Utc>,
}

/// Service banner on `/`.
pub async fn root_handler() -> (StatusCode, Json<ServiceInfo>) {
    (
        StatusCode::OK,
        Json(ServiceInfo {
            service: "menu-export-worker",
            status: "running",
            timestamp: Utc::now(),
        }),
    )
}

/// `GET /health`: 200 when every probe passes, 503 otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match tokio::time::timeout(DB_PROBE_TIMEOUT, state.store.ping()).await {
        Ok(Ok(())) => CheckResult {
            healthy: true,
            error: None,
        },
        Ok(Err(err)) => CheckResult {
            healthy: false,
            error: Some(err.to_string()),
        },
        Err(_) => CheckResult {
            healthy: false,
            error: Some("database probe timed out".to_string()),
        },
    };

    let storage = match state.blobs.list("", 1).await {
        Ok(_) => CheckResult {
            healthy: true,
            error: None,
        },
        Err(err) => CheckResult {
            healthy: false,
            error: Some(err.to_string()),
        },
    };

    let render = match state.pool.probe().await {
        Ok(()) => CheckResult {
            healthy: true,
            error: None,
        },
        Err(err) => CheckResult {
            healthy: false,
            error: Some(err.to_string()),
        },
    };

    let memory = memory_check();

    let healthy = database.healthy && storage.healthy && render.healthy && memory.healthy;
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let stats = state.pool.stats();
    state.metrics.render_pool_in_use.set(stats.in_use as i64);

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: Utc::now(),
            checks: HealthChecks {
                database,
                storage,
                render,
                memory,
            },
        }),
    )
}

fn memory_check() -> MemoryCheck {
    let mut system = System::new();
    system.refresh_memory();

    let total = system.total_memory() as f64;
    let used = system.used_memory() as f64;
    if total <= 0.0 {
        return MemoryCheck {
            healthy: true,
            message: "memory usage unavailable".to_string(),
        };
    }

    let ratio = used / total;
    MemoryCheck {
        healthy: ratio <= MEMORY_PRESSURE_THRESHOLD,
        message: format!("{:.0}% of memory in use", ratio * 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_check_reports_a_ratio() {
        let check = memory_check();
        assert!(check.message.contains("memory"));
    }
}
