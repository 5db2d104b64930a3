//! Process lifecycle: startup wiring, periodic sweeps, cooperative
//! shutdown.
//!
//! Startup order matters: config → metrics → job store (with retry) →
//! blob store → render pool (canary) → HTTP listeners → sweeps → poller.
//! A failure anywhere in that chain aborts the process with exit code 1
//! before any job is claimed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domains::menu::MenuTemplateRenderer;
use crate::kernel::extract::MenuExtractor;
use crate::kernel::jobs::{JobStore, PgJobStore, Poller, PollerConfig, Processor};
use crate::kernel::metrics::Metrics;
use crate::kernel::notifier::{NoopNotifier, Notifier, WebhookNotifier};
use crate::kernel::render::chrome::ChromeLauncher;
use crate::kernel::render::{RenderPool, UrlPolicy};
use crate::kernel::storage::{BlobStore, HttpBlobStore};
use crate::server::{health_router, metrics_router, AppState};

const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(86_400);
const RETENTION_DAYS: i64 = 30;

/// Run the worker until a shutdown signal lands. Errors returned from here
/// become exit code 1.
pub async fn run(config: Config) -> Result<()> {
    run_with(config, None).await
}

/// Variant that lets an embedder supply the extraction collaborator.
pub async fn run_with(
    config: Config,
    extractor: Option<Arc<dyn MenuExtractor>>,
) -> Result<()> {
    info!(worker_id = %config.worker_id, "worker starting");

    let metrics = Metrics::new().context("failed to build metrics registry")?;

    let store = Arc::new(
        PgJobStore::connect(&config.database_url, config.db_max_retries, config.db_retry_delay)
            .await
            .context("failed to initialise job store")?,
    );
    info!("job store ready");

    let blobs = Arc::new(
        HttpBlobStore::new(
            &config.store_url,
            config.public_store_url.as_deref(),
            &config.blob_bucket,
            &config.store_key,
            metrics.clone(),
        )
        .context("failed to initialise blob store")?,
    );

    let policy = UrlPolicy::new(config.allowed_content_hosts.iter().cloned());
    let pool = Arc::new(RenderPool::new(
        config.max_renders,
        ChromeLauncher::new(config.browser_executable.clone()),
        policy.clone(),
        config.job_timeout,
    ));
    metrics.render_pool_capacity.set(config.max_renders as i64);

    if config.enable_canary {
        pool.canary().await.context("render canary failed")?;
        info!("render canary passed");
    } else {
        warn!("render canary disabled by configuration");
    }

    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(endpoint) => Arc::new(
            WebhookNotifier::new(endpoint, config.notify_key.as_deref())
                .context("failed to initialise notifier")?,
        ),
        None => Arc::new(NoopNotifier),
    };

    let extraction_first = match (&extractor, config.enable_extraction) {
        (Some(_), true) => true,
        (None, true) => {
            warn!("ENABLE_EXTRACTION is set but no extractor is wired in; claiming exports only");
            false
        }
        (_, false) => false,
    };

    let templates = Arc::new(MenuTemplateRenderer::new(policy));
    let processor = Arc::new(Processor::new(
        store.clone() as Arc<dyn JobStore>,
        pool.clone(),
        blobs.clone() as Arc<dyn BlobStore>,
        templates,
        notifier,
        extractor,
        metrics.clone(),
        config.job_timeout,
    ));

    let poller = Poller::new(
        store.clone() as Arc<dyn JobStore>,
        processor,
        metrics.clone(),
        PollerConfig {
            worker_id: config.worker_id.clone(),
            poll_busy: config.poll_busy,
            poll_idle: config.poll_idle,
            extraction_first,
        },
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    // HTTP surfaces. Binding failures are startup failures.
    let state = AppState {
        store: store.clone() as Arc<dyn JobStore>,
        blobs: blobs.clone() as Arc<dyn BlobStore>,
        pool: pool.clone(),
        metrics: metrics.clone(),
    };
    let health_listener = TcpListener::bind(("0.0.0.0", config.health_port))
        .await
        .with_context(|| format!("failed to bind health port {}", config.health_port))?;
    let metrics_listener = TcpListener::bind(("0.0.0.0", config.metrics_port))
        .await
        .with_context(|| format!("failed to bind metrics port {}", config.metrics_port))?;
    info!(
        health_port = config.health_port,
        metrics_port = config.metrics_port,
        "HTTP listeners ready"
    );

    let health_token = shutdown.clone();
    tokio::spawn(async move {
        let app = health_router(state);
        if let Err(err) = axum::serve(health_listener, app)
            .with_graceful_shutdown(async move { health_token.cancelled().await })
            .await
        {
            error!(error = %err, "health server failed");
        }
    });

    let metrics_token = shutdown.clone();
    let metrics_for_server = metrics.clone();
    tokio::spawn(async move {
        let app = metrics_router(metrics_for_server);
        if let Err(err) = axum::serve(metrics_listener, app)
            .with_graceful_shutdown(async move { metrics_token.cancelled().await })
            .await
        {
            error!(error = %err, "metrics server failed");
        }
    });

    // Periodic sweeps. Safe on every replica: the predicates self-serialise
    // through the database.
    tokio::spawn(stale_sweep_loop(
        store.clone() as Arc<dyn JobStore>,
        metrics.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(retention_sweep_loop(
        store.clone() as Arc<dyn JobStore>,
        blobs.clone() as Arc<dyn BlobStore>,
        metrics.clone(),
        shutdown.clone(),
    ));

    // The poller is the replica's main loop.
    let poller_token = shutdown.clone();
    let poller_handle = tokio::spawn(async move { poller.run(poller_token).await });

    shutdown.cancelled().await;
    info!("shutting down; waiting for the current job to finish");

    // Give the in-flight job its budget; past that, the stale sweep on some
    // replica recovers the row.
    match tokio::time::timeout(config.shutdown_timeout, poller_handle).await {
        Ok(Ok(())) => info!("poller drained cleanly"),
        Ok(Err(join_err)) => {
            return Err(anyhow::anyhow!("poller task failed during shutdown: {join_err}"));
        }
        Err(_) => warn!(
            timeout_ms = config.shutdown_timeout.as_millis() as u64,
            "current job did not finish in time; leaving the row to the stale sweep"
        ),
    }

    pool.drain().await;
    store.close().await;

    info!("worker stopped");
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut signalled = false;
        loop {
            wait_for_signal().await;
            if signalled {
                // Second signal during shutdown is ignored.
                info!("already shutting down");
                continue;
            }
            signalled = true;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            // Fall back to SIGINT only.
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Reset abandoned `processing` rows every five minutes. Never escalates:
/// failures are logged and the next tick proceeds.
async fn stale_sweep_loop(
    store: Arc<dyn JobStore>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(STALE_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // Skip the immediate first tick.

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match store.find_stale().await {
            Ok(stale) if stale.is_empty() => {}
            Ok(stale) => {
                for id in &stale {
                    info!(job_id = %id, "stale job found, resetting");
                }
                match store.reset_all_stale().await {
                    Ok(count) => {
                        metrics.stale_recovered.inc_by(count);
                        info!(count, "stale sweep finished");
                    }
                    Err(err) => warn!(error = %err, "stale sweep reset failed"),
                }
            }
            Err(err) => warn!(error = %err, "stale sweep scan failed"),
        }
    }
}

/// Remove completed rows (and their blobs, best-effort) older than the
/// retention window, once a day.
async fn retention_sweep_loop(
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // Skip the immediate first tick.

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let before = Utc::now() - chrono::Duration::days(RETENTION_DAYS);

        let rows = match store.find_old_completed(before).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "retention scan failed");
                continue;
            }
        };
        if rows.is_empty() {
            continue;
        }

        for row in &rows {
            if let Some(path) = &row.storage_path {
                if let Err(err) = blobs.delete(path).await {
                    warn!(job_id = %row.id, object = %path, error = %err, "failed to delete expired artifact");
                }
            }
        }

        match store.delete_old_completed(before).await {
            Ok(count) => {
                metrics.retention_deleted.inc_by(count);
                info!(count, "retention sweep finished");
            }
            Err(err) => warn!(error = %err, "retention delete failed"),
        }
    }
}
