//! Test doubles for the queue and its collaborators.
//!
//! The in-memory store implements the full [`JobStore`] contract so the
//! queue's properties can be exercised without a database; the spies record
//! every interaction for assertions. All doubles share an optional
//! operation journal so tests can assert cross-component ordering (path
//! persisted before upload before complete).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::kernel::extract::{ExtractError, MenuExtractor};
use crate::kernel::notifier::Notifier;
use crate::kernel::render::{RenderError, RenderOptions, RenderTarget, Renderer};
use crate::kernel::storage::{BlobEntry, BlobStore, StorageError};

use super::job::{CompletedArtifact, Job, JobFamily, JobKind, JobState, QueueStats};
use super::store::{JobStore, ProcessingFields, StoreError, STALE_THRESHOLD_SECS};

/// Shared cross-double call journal.
pub type OpJournal = Arc<Mutex<Vec<String>>>;

pub fn new_journal() -> OpJournal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Plausible PDF bytes for renderer doubles.
pub fn fake_pdf_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.7\n% fake\n".to_vec();
    bytes.resize(len.max(bytes.len()), b' ');
    bytes
}

/// Plausible PNG bytes for renderer doubles.
pub fn fake_png_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.resize(len.max(bytes.len()), 0);
    bytes
}

// =============================================================================
// In-memory JobStore
// =============================================================================

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<Uuid, Job>,
    /// Virtual clock offset so tests can cross backoff and staleness
    /// boundaries without sleeping.
    clock_offset: Duration,
}

/// Contract-complete in-memory [`JobStore`].
pub struct InMemoryJobStore {
    inner: Mutex<StoreInner>,
    journal: Option<OpJournal>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            journal: None,
        }
    }

    pub fn with_journal(journal: OpJournal) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            journal: Some(journal),
        }
    }

    fn record(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal.lock().expect("journal mutex poisoned").push(entry);
        }
    }

    /// Move the store's virtual clock forward.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.clock_offset = inner.clock_offset + by;
    }

    pub fn now(&self) -> DateTime<Utc> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Utc::now() + inner.clock_offset
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .jobs
            .get(&id)
            .cloned()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").jobs.len()
    }

    fn update<T>(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut Job, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Utc::now() + inner.clock_offset;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::Conflict(id))?;
        apply(job, now)
    }
}

fn require_processing(job: &Job) -> Result<(), StoreError> {
    if job.state == JobState::Processing {
        Ok(())
    } else {
        Err(StoreError::Conflict(job.id))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim(&self, worker_id: &str, family: JobFamily) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Utc::now() + inner.clock_offset;

        let mut eligible: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| {
                job.family == family && job.state == JobState::Pending && job.available_at <= now
            })
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let Some(id) = eligible.first().map(|job| job.id) else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).ok_or(StoreError::Conflict(id))?;
        job.state = JobState::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.updated_at = now;
        let claimed = job.clone();
        drop(inner);

        self.record(format!("claim:{id}"));
        Ok(Some(claimed))
    }

    async fn set_processing_fields(
        &self,
        id: Uuid,
        fields: ProcessingFields,
    ) -> Result<(), StoreError> {
        let path = fields.storage_path.clone();
        self.update(id, move |job, now| {
            require_processing(job)?;
            if let Some(path) = fields.storage_path {
                job.storage_path = Some(path);
            }
            job.updated_at = now;
            Ok(())
        })?;
        self.record(format!(
            "set_processing_fields:{id}:{}",
            path.unwrap_or_default()
        ));
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        storage_path: &str,
        artifact_url: &str,
    ) -> Result<(), StoreError> {
        self.update(id, |job, now| {
            require_processing(job)?;
            job.state = JobState::Completed;
            job.storage_path = Some(storage_path.to_string());
            job.artifact_url = Some(artifact_url.to_string());
            job.error_message = None;
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })?;
        self.record(format!("complete:{id}"));
        Ok(())
    }

    async fn complete_extraction(
        &self,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.update(id, |job, now| {
            require_processing(job)?;
            job.state = JobState::Completed;
            job.result = Some(result);
            job.error_message = None;
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })?;
        self.record(format!("complete_extraction:{id}"));
        Ok(())
    }

    async fn fail_terminal(&self, id: Uuid, user_message: &str) -> Result<(), StoreError> {
        self.update(id, |job, now| {
            require_processing(job)?;
            job.state = JobState::Failed;
            job.error_message = Some(user_message.to_string());
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })?;
        self.record(format!("fail_terminal:{id}"));
        Ok(())
    }

    async fn reset_with_backoff(
        &self,
        id: Uuid,
        delay_seconds: i64,
        error_message: &str,
    ) -> Result<(), StoreError> {
        self.update(id, |job, now| {
            require_processing(job)?;
            job.state = JobState::Pending;
            job.retry_count += 1;
            job.available_at = now + Duration::seconds(delay_seconds);
            job.worker_id = None;
            job.started_at = None;
            job.error_message = Some(error_message.to_string());
            job.updated_at = now;
            Ok(())
        })?;
        self.record(format!("reset_with_backoff:{id}:{delay_seconds}"));
        Ok(())
    }

    async fn reset_immediate(&self, id: Uuid) -> Result<(), StoreError> {
        self.update(id, |job, now| {
            require_processing(job)?;
            job.state = JobState::Pending;
            job.available_at = now;
            job.worker_id = None;
            job.started_at = None;
            job.updated_at = now;
            Ok(())
        })?;
        self.record(format!("reset_immediate:{id}"));
        Ok(())
    }

    async fn find_stale(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let now = Utc::now() + inner.clock_offset;
        let threshold = now - Duration::seconds(STALE_THRESHOLD_SECS);
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Processing
                    && job.started_at.map(|t| t < threshold).unwrap_or(false)
            })
            .map(|job| job.id)
            .collect())
    }

    async fn reset_all_stale(&self) -> Result<u64, StoreError> {
        let stale = self.find_stale().await?;
        let count = stale.len() as u64;
        for id in stale {
            self.reset_immediate(id).await?;
        }
        Ok(count)
    }

    async fn queue_depth(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let now = Utc::now() + inner.clock_offset;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending && job.available_at <= now)
            .count() as i64)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let pending = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .count() as i64;
        let processing = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Processing)
            .count() as i64;
        Ok(QueueStats {
            pending,
            processing,
            completed_24h: inner
                .jobs
                .values()
                .filter(|j| j.state == JobState::Completed)
                .count() as i64,
            failed_24h: inner
                .jobs
                .values()
                .filter(|j| j.state == JobState::Failed)
                .count() as i64,
            avg_processing_seconds: 0.0,
            oldest_pending_seconds: 0.0,
        })
    }

    async fn find_old_completed(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<CompletedArtifact>, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Completed && job.created_at < before)
            .map(|job| CompletedArtifact {
                id: job.id,
                storage_path: job.storage_path.clone(),
            })
            .collect())
    }

    async fn delete_old_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let doomed: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Completed && job.created_at < before)
            .map(|job| job.id)
            .collect();
        for id in &doomed {
            inner.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn count_recent_for_owner(
        &self,
        owner_id: Uuid,
        window: Duration,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let now = Utc::now() + inner.clock_offset;
        let cutoff = now - window;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.owner_id == owner_id && job.created_at > cutoff)
            .count() as i64)
    }

    async fn count_active_for_owner(&self, owner_id: Uuid) -> Result<i64, StoreError> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .jobs
            .values()
            .filter(|job| {
                job.owner_id == owner_id
                    && matches!(job.state, JobState::Pending | JobState::Processing)
            })
            .count() as i64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// Renderer double
// =============================================================================

/// Scripted renderer: pops queued outcomes, then falls back to plausible
/// bytes for the requested target.
pub struct MockRenderer {
    script: Mutex<VecDeque<Result<Vec<u8>, RenderError>>>,
    calls: AtomicUsize,
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_outcome(&self, outcome: Result<Vec<u8>, RenderError>) {
        self.script
            .lock()
            .expect("renderer mutex poisoned")
            .push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn render(&self, _html: &str, opts: &RenderOptions) -> Result<Vec<u8>, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .expect("renderer mutex poisoned")
            .pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(match opts.target {
                RenderTarget::Pdf => fake_pdf_bytes(2_048),
                RenderTarget::Image { .. } => fake_png_bytes(2_048),
            }),
        }
    }
}

// =============================================================================
// BlobStore spy
// =============================================================================

#[derive(Default)]
struct BlobInner {
    objects: HashMap<String, Vec<u8>>,
    uploads: Vec<(String, usize, String)>,
    deleted: Vec<String>,
    upload_failures: VecDeque<StorageError>,
}

/// Records uploads and keeps the last object per path (upsert semantics).
pub struct SpyBlobStore {
    inner: Mutex<BlobInner>,
    journal: Option<OpJournal>,
}

impl Default for SpyBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SpyBlobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BlobInner::default()),
            journal: None,
        }
    }

    pub fn with_journal(journal: OpJournal) -> Self {
        Self {
            inner: Mutex::new(BlobInner::default()),
            journal: Some(journal),
        }
    }

    fn record(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal.lock().expect("journal mutex poisoned").push(entry);
        }
    }

    /// Script the next upload to fail.
    pub fn fail_next_upload(&self, err: StorageError) {
        self.inner
            .lock()
            .expect("blob mutex poisoned")
            .upload_failures
            .push_back(err);
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("blob mutex poisoned")
            .objects
            .get(path)
            .cloned()
    }

    pub fn uploads(&self) -> Vec<(String, usize, String)> {
        self.inner.lock().expect("blob mutex poisoned").uploads.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().expect("blob mutex poisoned").deleted.clone()
    }
}

#[async_trait]
impl BlobStore for SpyBlobStore {
    async fn upload(
        &self,
        bytes: &[u8],
        path: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        {
            let mut inner = self.inner.lock().expect("blob mutex poisoned");
            if let Some(err) = inner.upload_failures.pop_front() {
                return Err(err);
            }
            inner.objects.insert(path.to_string(), bytes.to_vec());
            inner
                .uploads
                .push((path.to_string(), bytes.len(), content_type.to_string()));
        }
        self.record(format!("upload:{path}"));
        Ok(format!("https://files.example.com/public/{path}"))
    }

    async fn signed_url(
        &self,
        path: &str,
        ttl_seconds: u64,
        download_filename: Option<&str>,
    ) -> Result<String, StorageError> {
        self.record(format!("signed_url:{path}"));
        let mut url = format!("https://files.example.com/sign/{path}?ttl={ttl_seconds}");
        if let Some(filename) = download_filename {
            url.push_str("&download=");
            url.push_str(filename);
        }
        Ok(url)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("blob mutex poisoned");
        inner.objects.remove(path);
        inner.deleted.push(path.to_string());
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<BlobEntry>, StorageError> {
        let inner = self.inner.lock().expect("blob mutex poisoned");
        Ok(inner
            .objects
            .keys()
            .filter(|path| path.starts_with(prefix))
            .take(limit)
            .map(|path| BlobEntry {
                name: path.clone(),
                created_at: None,
            })
            .collect())
    }

    async fn delete_older_than(&self, _before: DateTime<Utc>) -> Result<u64, StorageError> {
        Ok(0)
    }
}

// =============================================================================
// Notifier spy
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Completion {
        owner_id: Uuid,
        signed_url: String,
        display_name: String,
        kind: JobKind,
    },
    Failure {
        owner_id: Uuid,
        display_name: String,
        kind: JobKind,
        user_message: String,
    },
}

#[derive(Default)]
pub struct SpyNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl SpyNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotifierEvent> {
        self.events.lock().expect("notifier mutex poisoned").clone()
    }

    pub fn completion_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, NotifierEvent::Completion { .. }))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, NotifierEvent::Failure { .. }))
            .count()
    }
}

#[async_trait]
impl Notifier for SpyNotifier {
    async fn send_completion(
        &self,
        owner_id: Uuid,
        signed_url: &str,
        display_name: &str,
        kind: JobKind,
    ) {
        self.events
            .lock()
            .expect("notifier mutex poisoned")
            .push(NotifierEvent::Completion {
                owner_id,
                signed_url: signed_url.to_string(),
                display_name: display_name.to_string(),
                kind,
            });
    }

    async fn send_failure(
        &self,
        owner_id: Uuid,
        display_name: &str,
        kind: JobKind,
        user_message: &str,
    ) {
        self.events
            .lock()
            .expect("notifier mutex poisoned")
            .push(NotifierEvent::Failure {
                owner_id,
                display_name: display_name.to_string(),
                kind,
                user_message: user_message.to_string(),
            });
    }
}

// =============================================================================
// Extractor double
// =============================================================================

pub struct MockExtractor {
    script: Mutex<VecDeque<Result<serde_json::Value, ExtractError>>>,
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExtractor {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_outcome(&self, outcome: Result<serde_json::Value, ExtractError>) {
        self.script
            .lock()
            .expect("extractor mutex poisoned")
            .push_back(outcome);
    }
}

#[async_trait]
impl MenuExtractor for MockExtractor {
    async fn extract(&self, image_url: &str) -> Result<serde_json::Value, ExtractError> {
        let scripted = self
            .script
            .lock()
            .expect("extractor mutex poisoned")
            .pop_front();
        scripted.unwrap_or_else(|| {
            Ok(serde_json::json!({
                "source": image_url,
                "items": []
            }))
        })
    }
}
