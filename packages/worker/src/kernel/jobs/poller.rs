//! Adaptive polling loop.
//!
//! Single-flight: at most one outstanding `process` call per replica.
//! Parallelism comes from running more replicas, not from fanning out
//! inside one.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kernel::metrics::Metrics;

use super::job::JobFamily;
use super::processor::Processor;
use super::store::JobStore;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub worker_id: String,
    /// Delay when eligible work exists but our claim came back empty.
    pub poll_busy: Duration,
    /// Delay when the queue is empty.
    pub poll_idle: Duration,
    /// Claim the extraction family before exports.
    pub extraction_first: bool,
}

/// What a tick decided to do next.
#[derive(Debug, PartialEq, Eq)]
enum Tick {
    /// A job was processed; claim again immediately.
    Processed,
    Sleep(Duration),
}

pub struct Poller {
    store: Arc<dyn JobStore>,
    processor: Arc<Processor>,
    metrics: Arc<Metrics>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<Processor>,
        metrics: Arc<Metrics>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            metrics,
            config,
        }
    }

    /// Run until cancelled. A claim that is in flight when the token fires
    /// completes normally; the loop exits at the next suspension point.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "poller starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.tick().await {
                Tick::Processed => continue,
                Tick::Sleep(delay) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "poller stopped");
    }

    async fn tick(&self) -> Tick {
        for family in self.claim_order() {
            match self.store.claim(&self.config.worker_id, family).await {
                Ok(Some(job)) => {
                    self.metrics.claims.with_label_values(&["claimed"]).inc();
                    debug!(
                        job_id = %job.id,
                        family = family.as_str(),
                        priority = job.priority,
                        retry_count = job.retry_count,
                        "claimed job"
                    );
                    self.processor.process(job).await;
                    return Tick::Processed;
                }
                Ok(None) => continue,
                Err(err) => {
                    self.metrics.claims.with_label_values(&["error"]).inc();
                    error!(error = %err, "claim failed");
                    return Tick::Sleep(self.config.poll_idle);
                }
            }
        }

        self.metrics.claims.with_label_values(&["empty"]).inc();
        match self.store.queue_depth().await {
            Ok(depth) => {
                self.metrics.queue_depth.set(depth);
                if depth > 0 {
                    // Work exists but other replicas hold it; come back soon.
                    Tick::Sleep(self.config.poll_busy)
                } else {
                    Tick::Sleep(self.config.poll_idle)
                }
            }
            Err(err) => {
                warn!(error = %err, "queue depth check failed");
                Tick::Sleep(self.config.poll_idle)
            }
        }
    }

    fn claim_order(&self) -> Vec<JobFamily> {
        if self.config.extraction_first {
            vec![JobFamily::Extraction, JobFamily::Export]
        } else {
            vec![JobFamily::Export]
        }
    }
}
