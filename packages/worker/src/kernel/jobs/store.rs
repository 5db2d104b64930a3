//! The durable queue contract every worker replica runs against.
//!
//! All cross-replica coordination happens through these operations; the
//! implementations must keep each one safe under concurrent callers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::job::{CompletedArtifact, Job, JobFamily, QueueStats};

/// A `processing` row untouched for longer than this is considered
/// abandoned and eligible for the stale sweep. Strict comparison: a job at
/// exactly five minutes is not yet stale.
pub const STALE_THRESHOLD_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The row is not in the state the operation requires (for example a
    /// `complete` against a job the stale sweep already reclaimed).
    #[error("job {0} is not in the expected state")]
    Conflict(Uuid),
    /// Transport-level outage surfaced after the internal retry budget.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// Partial update applied while a job is `processing`.
#[derive(Debug, Clone, Default)]
pub struct ProcessingFields {
    pub storage_path: Option<String>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending row (used by the enqueuing collaborator and tests).
    async fn insert(&self, job: Job) -> Result<Job, StoreError>;

    /// Atomically claim the highest-priority eligible row of `family`:
    /// `state = pending AND available_at <= now`, ordered
    /// `priority DESC, created_at ASC`, skipping locked rows. Concurrent
    /// callers see disjoint results.
    async fn claim(&self, worker_id: &str, family: JobFamily) -> Result<Option<Job>, StoreError>;

    /// Partial update under `state = processing`.
    async fn set_processing_fields(
        &self,
        id: Uuid,
        fields: ProcessingFields,
    ) -> Result<(), StoreError>;

    /// Terminal success. Fails with [`StoreError::Conflict`] if the row is
    /// no longer `processing`.
    async fn complete(
        &self,
        id: Uuid,
        storage_path: &str,
        artifact_url: &str,
    ) -> Result<(), StoreError>;

    /// Terminal success for extraction jobs: stores the extracted payload.
    async fn complete_extraction(
        &self,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Terminal failure with a user-safe message.
    async fn fail_terminal(&self, id: Uuid, user_message: &str) -> Result<(), StoreError>;

    /// `processing -> pending` with `retry_count += 1` and
    /// `available_at = now + delay`.
    async fn reset_with_backoff(
        &self,
        id: Uuid,
        delay_seconds: i64,
        error_message: &str,
    ) -> Result<(), StoreError>;

    /// `processing -> pending` immediately, without consuming a retry.
    /// Only the stale sweep calls this.
    async fn reset_immediate(&self, id: Uuid) -> Result<(), StoreError>;

    /// Ids of `processing` rows whose worker has gone quiet past the
    /// stale threshold.
    async fn find_stale(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Bulk [`JobStore::reset_immediate`] over the stale predicate.
    async fn reset_all_stale(&self) -> Result<u64, StoreError>;

    /// Count of rows eligible for claim right now. Backpressure only.
    async fn queue_depth(&self) -> Result<i64, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Completed rows older than `before`, for the retention sweep.
    async fn find_old_completed(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<CompletedArtifact>, StoreError>;

    async fn delete_old_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Rate-limit helper: rows created by `owner_id` within `window`.
    async fn count_recent_for_owner(
        &self,
        owner_id: Uuid,
        window: Duration,
    ) -> Result<i64, StoreError>;

    /// Quota helper: pending or processing rows owned by `owner_id`.
    async fn count_active_for_owner(&self, owner_id: Uuid) -> Result<i64, StoreError>;

    /// Cheap reachability probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
