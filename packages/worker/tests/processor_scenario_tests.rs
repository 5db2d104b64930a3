//! End-to-end scenarios for the per-job state machine, run against the
//! in-memory queue and spy collaborators.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use worker_core::domains::menu::MenuTemplateRenderer;
use worker_core::kernel::extract::MenuExtractor;
use worker_core::kernel::jobs::testing::{
    fake_pdf_bytes, new_journal, InMemoryJobStore, MockExtractor, MockRenderer, NotifierEvent,
    OpJournal, SpyBlobStore, SpyNotifier,
};
use worker_core::kernel::jobs::{
    Job, JobFamily, JobKind, JobState, JobStore, Poller, PollerConfig, Processor,
};
use worker_core::kernel::metrics::Metrics;
use worker_core::kernel::storage::BlobStore;
use worker_core::kernel::render::{RenderError, UrlPolicy};
use worker_core::kernel::storage::StorageError;

struct Harness {
    store: Arc<InMemoryJobStore>,
    renderer: Arc<MockRenderer>,
    blobs: Arc<SpyBlobStore>,
    notifier: Arc<SpyNotifier>,
    processor: Processor,
    journal: OpJournal,
}

fn harness() -> Harness {
    harness_with_extractor(None)
}

fn harness_with_extractor(extractor: Option<Arc<dyn MenuExtractor>>) -> Harness {
    let journal = new_journal();
    let store = Arc::new(InMemoryJobStore::with_journal(journal.clone()));
    let renderer = Arc::new(MockRenderer::new());
    let blobs = Arc::new(SpyBlobStore::with_journal(journal.clone()));
    let notifier = Arc::new(SpyNotifier::new());
    let metrics = Metrics::new().unwrap();

    let processor = Processor::new(
        store.clone(),
        renderer.clone(),
        blobs.clone(),
        Arc::new(MenuTemplateRenderer::new(UrlPolicy::default())),
        notifier.clone(),
        extractor,
        metrics,
        StdDuration::from_secs(60),
    );

    Harness {
        store,
        renderer,
        blobs,
        notifier,
        processor,
        journal,
    }
}

fn render_snapshot_json() -> serde_json::Value {
    json!({
        "template_id": "classic",
        "template_version": "3",
        "template_name": "Classic",
        "menu_data": {
            "id": "7b7c6f2e-97a5-4df0-9b6a-1f8f6f0f2a11",
            "name": "Trattoria Lucia",
            "currency": "EUR",
            "items": [
                {"name": "Margherita", "price": 9.5, "category": "Pizza"},
                {"name": "House Red", "price": 4.0, "category": "Drinks"}
            ],
            "categories": [
                {"name": "Pizza", "sort_order": 0},
                {"name": "Drinks", "sort_order": 1}
            ]
        },
        "export_options": {"format": "A4"},
        "snapshot_created_at": "2026-05-01T10:00:00Z",
        "snapshot_version": 1
    })
}

fn export_job(kind: JobKind, priority: i32) -> Job {
    Job::builder()
        .owner_id(Uuid::new_v4())
        .target_id(Uuid::new_v4())
        .kind(kind)
        .priority(priority)
        .metadata(json!({
            "display_name": "Dinner Menu",
            "render_snapshot": render_snapshot_json(),
        }))
        .build()
}

async fn claim_and_process(h: &Harness) -> Job {
    let claimed = h
        .store
        .claim("worker-test", JobFamily::Export)
        .await
        .unwrap()
        .expect("expected a claimable job");
    let id = claimed.id;
    h.processor.process(claimed).await;
    h.store.get(id).unwrap()
}

// S1: happy path PDF export.
#[tokio::test]
async fn happy_path_pdf_completes_with_one_email() {
    let h = harness();
    let job = export_job(JobKind::Pdf, 100);
    let owner = job.owner_id;
    let id = job.id;
    h.store.insert(job).await.unwrap();

    let done = claim_and_process(&h).await;

    assert_eq!(done.state, JobState::Completed);
    let expected_path = format!("{owner}/exports/pdf/{id}.pdf");
    assert_eq!(done.storage_path.as_deref(), Some(expected_path.as_str()));
    let url = done.artifact_url.expect("completed jobs carry an artifact URL");
    assert!(url.contains(&expected_path));
    assert!(done.completed_at.is_some());

    // The blob landed under the deterministic path, as a PDF.
    let object = h.blobs.object(&expected_path).expect("uploaded object");
    assert!(object.starts_with(b"%PDF-"));
    let uploads = h.blobs.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].2, "application/pdf");

    // Exactly one completion email, no failure email.
    assert_eq!(h.notifier.completion_count(), 1);
    assert_eq!(h.notifier.failure_count(), 0);
    match &h.notifier.events()[0] {
        NotifierEvent::Completion {
            owner_id,
            signed_url,
            display_name,
            kind,
        } => {
            assert_eq!(*owner_id, owner);
            assert!(signed_url.contains("download=Dinner-Menu"));
            assert_eq!(display_name, "Dinner Menu");
            assert_eq!(*kind, JobKind::Pdf);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// Property 6: path persisted before upload, upload before complete.
#[tokio::test]
async fn storage_ordering_is_path_then_upload_then_complete() {
    let h = harness();
    h.store.insert(export_job(JobKind::Pdf, 10)).await.unwrap();
    claim_and_process(&h).await;

    let journal = h.journal.lock().unwrap().clone();
    let position = |needle: &str| {
        journal
            .iter()
            .position(|entry| entry.starts_with(needle))
            .unwrap_or_else(|| panic!("no {needle} entry in {journal:?}"))
    };

    let set_path = position("set_processing_fields:");
    let upload = position("upload:");
    let complete = position("complete:");
    assert!(set_path < upload, "storage_path must be persisted before the upload");
    assert!(upload < complete, "the upload must land before completion");
}

// S2: transient failure, then success after the backoff.
#[tokio::test]
async fn transient_render_failure_retries_with_backoff_and_no_email() {
    let h = harness();
    h.renderer
        .push_outcome(Err(RenderError::Timeout(StdDuration::from_secs(60))));
    h.store.insert(export_job(JobKind::Pdf, 10)).await.unwrap();

    let after_first = claim_and_process(&h).await;
    assert_eq!(after_first.state, JobState::Pending);
    assert_eq!(after_first.retry_count, 1);
    let delay = (after_first.available_at - h.store.now()).num_seconds();
    assert!((9..=11).contains(&delay), "first retry delay was {delay}s");
    assert!(h.notifier.events().is_empty(), "no email on mid-retry resets");

    // Not eligible yet.
    assert!(h
        .store
        .claim("worker-test", JobFamily::Export)
        .await
        .unwrap()
        .is_none());

    h.store.advance(Duration::seconds(11));
    let done = claim_and_process(&h).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(h.notifier.completion_count(), 1);
    assert_eq!(h.renderer.calls(), 2);
}

// S3: retry budget exhausted, terminal failure, exactly one email.
#[tokio::test]
async fn repeated_transient_failures_become_terminal_after_the_budget() {
    let h = harness();
    for _ in 0..4 {
        h.renderer
            .push_outcome(Err(RenderError::Timeout(StdDuration::from_secs(60))));
    }
    h.store.insert(export_job(JobKind::Pdf, 10)).await.unwrap();

    // Three resets with growing backoff...
    for expected_retry in 1..=3 {
        let job = claim_and_process(&h).await;
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retry_count, expected_retry);
        h.store.advance(Duration::seconds(400));
    }

    // ...and the fourth attempt fails terminally.
    let done = claim_and_process(&h).await;
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.retry_count, 3);
    let message = done.error_message.expect("terminal jobs carry a message");
    assert!(!message.is_empty());

    assert_eq!(h.notifier.failure_count(), 1);
    assert_eq!(h.notifier.completion_count(), 0);
}

// Property 9: the backoff schedule is 10, 20, 40 seconds for r = 0, 1, 2.
#[tokio::test]
async fn backoff_doubles_across_consecutive_retries() {
    let h = harness();
    for _ in 0..3 {
        h.renderer
            .push_outcome(Err(RenderError::Timeout(StdDuration::from_secs(60))));
    }
    h.store.insert(export_job(JobKind::Pdf, 10)).await.unwrap();

    for expected_delay in [10i64, 20, 40] {
        let job = claim_and_process(&h).await;
        let delay = (job.available_at - h.store.now()).num_seconds();
        assert!(
            (expected_delay - 1..=expected_delay + 1).contains(&delay),
            "expected ~{expected_delay}s, got {delay}s"
        );
        h.store.advance(Duration::seconds(expected_delay + 1));
    }
}

// S4: invalid output is terminal on the first attempt.
#[tokio::test]
async fn invalid_render_output_fails_without_retry() {
    let h = harness();
    h.renderer.push_outcome(Ok(b"not a pdf".to_vec()));
    h.store.insert(export_job(JobKind::Pdf, 10)).await.unwrap();

    let done = claim_and_process(&h).await;

    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.retry_count, 0, "permanent failures consume no retry slot");
    assert_eq!(h.renderer.calls(), 1);
    assert_eq!(h.notifier.failure_count(), 1);
    assert!(h.blobs.uploads().is_empty(), "nothing is uploaded for invalid output");
}

// A missing snapshot is a permanent input problem.
#[tokio::test]
async fn missing_snapshot_fails_terminally() {
    let h = harness();
    let job = Job::builder()
        .owner_id(Uuid::new_v4())
        .target_id(Uuid::new_v4())
        .kind(JobKind::Pdf)
        .metadata(json!({"display_name": "No Snapshot"}))
        .build();
    h.store.insert(job).await.unwrap();

    let done = claim_and_process(&h).await;
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(h.notifier.failure_count(), 1);
}

// Storage circuit open: retried, not terminal, no email.
#[tokio::test]
async fn storage_unavailable_is_retried() {
    let h = harness();
    h.blobs.fail_next_upload(StorageError::Unavailable);
    h.store.insert(export_job(JobKind::Pdf, 10)).await.unwrap();

    let after_first = claim_and_process(&h).await;
    assert_eq!(after_first.state, JobState::Pending);
    assert_eq!(after_first.retry_count, 1);
    assert!(h.notifier.events().is_empty());

    h.store.advance(Duration::seconds(11));
    let done = claim_and_process(&h).await;
    assert_eq!(done.state, JobState::Completed);
}

// S5: a crashed worker's row is recovered and finished elsewhere.
#[tokio::test]
async fn stale_row_is_recovered_and_completed_by_another_worker() {
    let h = harness();
    let job = export_job(JobKind::Pdf, 10);
    let id = job.id;
    h.store.insert(job).await.unwrap();

    // Worker A claims and crashes.
    h.store
        .claim("worker-a", JobFamily::Export)
        .await
        .unwrap()
        .unwrap();

    // 5 minutes and a second later a sweep on another replica runs.
    h.store.advance(Duration::seconds(301));
    assert_eq!(h.store.reset_all_stale().await.unwrap(), 1);

    let recovered = h.store.get(id).unwrap();
    assert_eq!(recovered.state, JobState::Pending);
    assert_eq!(recovered.retry_count, 0);
    assert!(recovered.available_at <= h.store.now());

    // Worker C picks it up and completes it.
    let done = claim_and_process(&h).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.id, id);
}

// S6: crash after upload, before complete; the retry overwrites the blob.
#[tokio::test]
async fn retry_after_crash_overwrites_the_same_object() {
    let h = harness();
    let job = export_job(JobKind::Pdf, 10);
    let id = job.id;
    let path = format!("{}/exports/pdf/{}.pdf", job.owner_id, id);
    h.store.insert(job).await.unwrap();

    // Worker A gets as far as the upload, then dies before `complete`.
    let claimed = h
        .store
        .claim("worker-a", JobFamily::Export)
        .await
        .unwrap()
        .unwrap();
    h.store
        .set_processing_fields(
            claimed.id,
            worker_core::kernel::jobs::ProcessingFields {
                storage_path: Some(path.clone()),
            },
        )
        .await
        .unwrap();
    h.blobs
        .upload(&fake_pdf_bytes(1_024), &path, "application/pdf")
        .await
        .unwrap();

    // Stale sweep recovers the row; the half-done blob stays behind.
    h.store.advance(Duration::seconds(301));
    h.store.reset_all_stale().await.unwrap();

    // The retry renders different bytes and overwrites the same object.
    h.renderer.push_outcome(Ok(fake_pdf_bytes(4_096)));
    let done = claim_and_process(&h).await;

    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.storage_path.as_deref(), Some(path.as_str()));
    let object = h.blobs.object(&path).unwrap();
    assert_eq!(object.len(), 4_096, "the second payload wins");
    let uploads = h.blobs.uploads();
    assert_eq!(uploads.len(), 2);
    assert!(uploads.iter().all(|(p, _, _)| p == &path));
}

// PNG exports land under the image path with the right signature.
#[tokio::test]
async fn image_exports_produce_png_artifacts() {
    let h = harness();
    let job = export_job(JobKind::Image, 10);
    let owner = job.owner_id;
    let id = job.id;
    h.store.insert(job).await.unwrap();

    let done = claim_and_process(&h).await;

    assert_eq!(done.state, JobState::Completed);
    let path = format!("{owner}/exports/image/{id}.png");
    assert_eq!(done.storage_path.as_deref(), Some(path.as_str()));
    let object = h.blobs.object(&path).unwrap();
    let png_signature: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    assert_eq!(object[..8], png_signature);
    assert_eq!(h.blobs.uploads()[0].2, "image/png");
}

// Extraction family: completes by storing the structured result.
#[tokio::test]
async fn extraction_jobs_store_their_result() {
    let extractor = Arc::new(MockExtractor::new());
    extractor.push_outcome(Ok(json!({"items": [{"name": "Pad Thai"}]})));
    let h = harness_with_extractor(Some(extractor));

    let job = Job::builder()
        .owner_id(Uuid::new_v4())
        .target_id(Uuid::new_v4())
        .family(JobFamily::Extraction)
        .kind(JobKind::Image)
        .metadata(json!({"source_image_url": "https://cdn.example.com/photo.jpg"}))
        .build();
    let id = job.id;
    h.store.insert(job).await.unwrap();

    let claimed = h
        .store
        .claim("worker-test", JobFamily::Extraction)
        .await
        .unwrap()
        .unwrap();
    h.processor.process(claimed).await;

    let done = h.store.get(id).unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.result.unwrap()["items"][0]["name"], "Pad Thai");
    // Extraction outcomes do not email anyone.
    assert!(h.notifier.events().is_empty());
}

// The poller claims extraction before export when the family is enabled.
#[tokio::test]
async fn poller_prefers_extraction_claims_and_stops_on_cancel() {
    let extractor = Arc::new(MockExtractor::new());
    let h = harness_with_extractor(Some(extractor));

    let extraction = Job::builder()
        .owner_id(Uuid::new_v4())
        .target_id(Uuid::new_v4())
        .family(JobFamily::Extraction)
        .kind(JobKind::Image)
        .metadata(json!({"source_image_url": "https://cdn.example.com/photo.jpg"}))
        .build();
    let extraction_id = extraction.id;
    let export = export_job(JobKind::Pdf, 100);
    let export_id = export.id;
    h.store.insert(extraction).await.unwrap();
    h.store.insert(export).await.unwrap();

    let poller = Poller::new(
        h.store.clone(),
        Arc::new(harness_processor(&h)),
        Metrics::new().unwrap(),
        PollerConfig {
            worker_id: "worker-poll".to_string(),
            poll_busy: StdDuration::from_millis(10),
            poll_idle: StdDuration::from_millis(10),
            extraction_first: true,
        },
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let token = shutdown.clone();
    let store = h.store.clone();
    let handle = tokio::spawn(async move { poller.run(token).await });

    // Wait until both jobs are done, then cancel.
    for _ in 0..200 {
        let extraction_done = store
            .get(extraction_id)
            .map(|j| j.state == JobState::Completed)
            .unwrap_or(false);
        let export_done = store
            .get(export_id)
            .map(|j| j.state == JobState::Completed)
            .unwrap_or(false);
        if extraction_done && export_done {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    shutdown.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("poller must stop promptly after cancellation")
        .unwrap();

    assert_eq!(h.store.get(extraction_id).unwrap().state, JobState::Completed);
    assert_eq!(h.store.get(export_id).unwrap().state, JobState::Completed);
}

/// Rebuild a processor sharing the harness doubles (the poller needs its
/// own `Arc<Processor>`).
fn harness_processor(h: &Harness) -> Processor {
    Processor::new(
        h.store.clone(),
        h.renderer.clone(),
        h.blobs.clone(),
        Arc::new(MenuTemplateRenderer::new(UrlPolicy::default())),
        h.notifier.clone(),
        Some(Arc::new(MockExtractor::new())),
        Metrics::new().unwrap(),
        StdDuration::from_secs(60),
    )
}
