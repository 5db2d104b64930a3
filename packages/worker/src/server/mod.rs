//! HTTP surface: health probes and metrics exposition.

pub mod app;
pub mod routes;

pub use app::{health_router, metrics_router, AppState};
