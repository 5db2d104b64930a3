//! Prometheus registry for the worker.
//!
//! Created once at supervisor start and passed explicitly; nothing here is
//! a global.

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    /// Outcomes per family/kind: completed, failed, retried.
    pub jobs_processed: IntCounterVec,
    /// Claim attempts: claimed, empty, error.
    pub claims: IntCounterVec,

    pub job_duration: Histogram,
    pub render_duration: Histogram,
    pub upload_duration: Histogram,

    pub queue_depth: IntGauge,
    pub render_pool_in_use: IntGauge,
    pub render_pool_capacity: IntGauge,
    pub storage_breaker_open: IntGauge,

    pub stale_recovered: IntCounter,
    pub retention_deleted: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let jobs_processed = IntCounterVec::new(
            Opts::new("jobs_processed_total", "Jobs that finished a tick"),
            &["family", "kind", "outcome"],
        )?;
        registry.register(Box::new(jobs_processed.clone()))?;

        let claims = IntCounterVec::new(
            Opts::new("claims_total", "Claim attempts by result"),
            &["result"],
        )?;
        registry.register(Box::new(claims.clone()))?;

        let job_duration = Histogram::with_opts(
            HistogramOpts::new("job_duration_seconds", "Wall time per processed job")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(job_duration.clone()))?;

        let render_duration = Histogram::with_opts(
            HistogramOpts::new("render_duration_seconds", "Headless render time")
                .buckets(vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(render_duration.clone()))?;

        let upload_duration = Histogram::with_opts(
            HistogramOpts::new("upload_duration_seconds", "Blob upload time")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(upload_duration.clone()))?;

        let queue_depth = IntGauge::new("queue_depth", "Eligible pending jobs")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let render_pool_in_use = IntGauge::new("render_pool_in_use", "Browsers currently rendering")?;
        registry.register(Box::new(render_pool_in_use.clone()))?;

        let render_pool_capacity = IntGauge::new("render_pool_capacity", "Render pool cap")?;
        registry.register(Box::new(render_pool_capacity.clone()))?;

        let storage_breaker_open =
            IntGauge::new("storage_breaker_open", "1 while the upload circuit is open")?;
        registry.register(Box::new(storage_breaker_open.clone()))?;

        let stale_recovered =
            IntCounter::new("stale_jobs_recovered_total", "Rows reset by the stale sweep")?;
        registry.register(Box::new(stale_recovered.clone()))?;

        let retention_deleted =
            IntCounter::new("retention_deleted_total", "Rows removed by the retention sweep")?;
        registry.register(Box::new(retention_deleted.clone()))?;

        Ok(Arc::new(Self {
            registry,
            jobs_processed,
            claims,
            job_duration,
            render_duration,
            upload_duration,
            queue_depth,
            render_pool_in_use,
            render_pool_capacity,
            storage_breaker_open,
            stale_recovered,
            retention_deleted,
        }))
    }

    /// Prometheus text exposition of every registered series.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not UTF-8: {e}")))
    }
}
