//! Per-job state machine.
//!
//! ```text
//! Processor.process(job)
//!     │
//!     ├─► resolve snapshot (frozen render input)
//!     ├─► template layer  → HTML
//!     ├─► render pool     → bytes
//!     ├─► validate output (magic bytes)
//!     ├─► persist storage_path      ─┐  this ordering is the
//!     ├─► upload to blob storage     ├─ at-least-once anchor:
//!     ├─► sign download URL          │  path before bytes,
//!     ├─► complete job row          ─┘  bytes before complete
//!     └─► notify owner (best-effort)
//! ```
//!
//! Any failure in the numbered steps goes through the retry policy: reset
//! with backoff while budget remains and the error is transient, terminal
//! `failed` otherwise. Emails go out only for terminal transitions.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::domains::menu::{
    resolve_snapshot, Orientation, RenderSnapshot, SnapshotError, TemplateError, TemplateRenderer,
};
use crate::kernel::extract::{ExtractError, MenuExtractor};
use crate::kernel::metrics::Metrics;
use crate::kernel::notifier::Notifier;
use crate::kernel::render::{validate_output, RenderError, RenderOptions, Renderer};
use crate::kernel::storage::{storage_path, BlobStore, StorageError, SIGNED_URL_TTL_SECS};

use super::job::{Job, JobFamily, JobKind};
use super::retry;
use super::store::{JobStore, ProcessingFields, StoreError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("invalid render output: {0}")]
    InvalidOutput(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extraction(#[from] ExtractError),
    #[error("extraction job has no source_image_url")]
    MissingSourceImage,
}

pub struct Processor {
    store: Arc<dyn JobStore>,
    renderer: Arc<dyn Renderer>,
    blobs: Arc<dyn BlobStore>,
    templates: Arc<dyn TemplateRenderer>,
    notifier: Arc<dyn Notifier>,
    extractor: Option<Arc<dyn MenuExtractor>>,
    metrics: Arc<Metrics>,
    job_timeout: std::time::Duration,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        renderer: Arc<dyn Renderer>,
        blobs: Arc<dyn BlobStore>,
        templates: Arc<dyn TemplateRenderer>,
        notifier: Arc<dyn Notifier>,
        extractor: Option<Arc<dyn MenuExtractor>>,
        metrics: Arc<Metrics>,
        job_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            renderer,
            blobs,
            templates,
            notifier,
            extractor,
            metrics,
            job_timeout,
        }
    }

    /// Drive one claimed job to `completed`, `failed`, or back to
    /// `pending`. Never returns an error: this is the catch-all boundary.
    pub async fn process(&self, job: Job) {
        let started = Instant::now();
        let family = job.family;
        let kind = job.kind;

        let outcome = match family {
            JobFamily::Export => self.run_export(&job).await,
            JobFamily::Extraction => self.run_extraction(&job).await,
        };

        self.metrics
            .job_duration
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                self.metrics
                    .jobs_processed
                    .with_label_values(&[family.as_str(), kind.as_str(), "completed"])
                    .inc();
            }
            Err(err) => self.handle_failure(&job, err).await,
        }
    }

    /// Steps 1-8 of the export machine, in mandatory order.
    async fn run_export(&self, job: &Job) -> Result<(), ProcessError> {
        let snapshot = resolve_snapshot(&job.metadata)?;
        let html = self.templates.render(&snapshot)?;

        let opts = self.render_options(job.kind, &snapshot);
        let render_started = Instant::now();
        let bytes = self.renderer.render(&html, &opts).await?;
        self.metrics
            .render_duration
            .observe(render_started.elapsed().as_secs_f64());

        let report = validate_output(&bytes, job.kind, opts.image_format());
        for warning in &report.warnings {
            warn!(job_id = %job.id, warning, "render output warning");
        }
        if !report.ok {
            return Err(ProcessError::InvalidOutput(report.errors.join("; ")));
        }

        // Persisting the deterministic path before the upload is what makes
        // a crash between upload and complete recoverable: the retry
        // overwrites the same object.
        let path = storage_path(job.owner_id, job.kind, job.id);
        self.store
            .set_processing_fields(
                job.id,
                ProcessingFields {
                    storage_path: Some(path.clone()),
                },
            )
            .await?;

        let upload_started = Instant::now();
        self.blobs
            .upload(&bytes, &path, job.kind.content_type())
            .await?;
        self.metrics
            .upload_duration
            .observe(upload_started.elapsed().as_secs_f64());

        let filename = download_filename(job, &snapshot);
        let signed_url = self
            .blobs
            .signed_url(&path, SIGNED_URL_TTL_SECS, Some(&filename))
            .await?;

        self.store.complete(job.id, &path, &signed_url).await?;

        info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            kind = job.kind.as_str(),
            size = report.size,
            "export completed"
        );

        // Fire-and-forget: a notification problem never fails the job.
        self.notifier
            .send_completion(
                job.owner_id,
                &signed_url,
                job.display_name().unwrap_or(&snapshot.template_name),
                job.kind,
            )
            .await;

        Ok(())
    }

    /// The extraction family runs a shorter machine: resolve the source
    /// image, call the collaborator, store the structured result.
    async fn run_extraction(&self, job: &Job) -> Result<(), ProcessError> {
        let extractor = self
            .extractor
            .as_ref()
            .ok_or_else(|| ExtractError::Permanent("no extractor configured".to_string()))?;

        let image_url = job
            .source_image_url()
            .ok_or(ProcessError::MissingSourceImage)?;

        let result = extractor.extract(image_url).await?;
        self.store.complete_extraction(job.id, result).await?;

        info!(job_id = %job.id, owner_id = %job.owner_id, "extraction completed");
        Ok(())
    }

    async fn handle_failure(&self, job: &Job, err: ProcessError) {
        let decision = retry::decide(&err, job.retry_count);
        let family = job.family.as_str();
        let kind = job.kind.as_str();

        if decision.should_retry {
            warn!(
                job_id = %job.id,
                retry_count = job.retry_count,
                delay_seconds = decision.retry_delay_seconds,
                error = %err,
                "job failed, scheduling retry"
            );
            if let Err(store_err) = self
                .store
                .reset_with_backoff(
                    job.id,
                    decision.retry_delay_seconds,
                    &decision.classification.internal_message,
                )
                .await
            {
                error!(job_id = %job.id, error = %store_err, "failed to reset job for retry");
            }
            self.metrics
                .jobs_processed
                .with_label_values(&[family, kind, "retried"])
                .inc();
            return;
        }

        error!(
            job_id = %job.id,
            retry_count = job.retry_count,
            error = %err,
            "job failed terminally"
        );
        if let Err(store_err) = self
            .store
            .fail_terminal(job.id, &decision.classification.user_message)
            .await
        {
            // The terminal transition did not commit; another replica owns
            // the outcome now, so no email either.
            error!(job_id = %job.id, error = %store_err, "failed to mark job as failed");
            return;
        }
        self.metrics
            .jobs_processed
            .with_label_values(&[family, kind, "failed"])
            .inc();

        if job.family == JobFamily::Export {
            self.notifier
                .send_failure(
                    job.owner_id,
                    job.display_name().unwrap_or("your menu"),
                    job.kind,
                    &decision.classification.user_message,
                )
                .await;
        }
    }

    fn render_options(&self, kind: JobKind, snapshot: &RenderSnapshot) -> RenderOptions {
        let opts = &snapshot.export_options;
        match kind {
            JobKind::Pdf => RenderOptions::pdf(
                opts.format,
                opts.orientation == Orientation::Landscape,
                self.job_timeout,
            ),
            JobKind::Image => RenderOptions::png(self.job_timeout),
        }
    }
}

/// Friendly filename for the signed URL's download disposition.
fn download_filename(job: &Job, snapshot: &RenderSnapshot) -> String {
    let base = job
        .display_name()
        .unwrap_or(&snapshot.menu_data.name);
    let mut sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(64);
    let sanitized = sanitized.trim_matches('-');
    let stem = if sanitized.is_empty() { "menu" } else { sanitized };
    format!("{stem}.{}", job.kind.extension())
}
