//! Blob storage: upload, signed URLs, retention deletes.

pub mod breaker;
pub mod http_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::kernel::jobs::JobKind;

pub use breaker::CircuitBreaker;
pub use http_store::HttpBlobStore;

/// Signed URLs default to a 7-day expiry.
pub const SIGNED_URL_TTL_SECS: u64 = 604_800;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The upload circuit breaker is open; the store was not contacted.
    #[error("storage_unavailable: upload circuit open")]
    Unavailable,
    #[error("storage request failed: {0}")]
    Transport(String),
    #[error("storage returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid storage response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upsert `bytes` at `path`; the same path on retry overwrites the
    /// previous object. Returns the public URL of the object.
    async fn upload(
        &self,
        bytes: &[u8],
        path: &str,
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Time-limited signed URL, optionally with a download disposition.
    async fn signed_url(
        &self,
        path: &str,
        ttl_seconds: u64,
        download_filename: Option<&str>,
    ) -> Result<String, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<BlobEntry>, StorageError>;

    /// Delete objects created before `before`; returns how many went.
    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// Deterministic object path for a job's artifact. Stable across retries
/// and replicas; this determinism is the at-least-once idempotency handle.
pub fn storage_path(owner_id: Uuid, kind: JobKind, job_id: Uuid) -> String {
    format!(
        "{owner_id}/exports/{}/{job_id}.{}",
        kind.as_str(),
        kind.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_deterministic_and_kind_aware() {
        let owner = Uuid::parse_str("9f1c7e6a-0b46-4e7c-8d2e-0a4f5b6c7d8e").unwrap();
        let job = Uuid::parse_str("0d9c1f9e-3f84-4f11-b6a7-2f6f7a8b9c0d").unwrap();

        let pdf = storage_path(owner, JobKind::Pdf, job);
        assert_eq!(
            pdf,
            "9f1c7e6a-0b46-4e7c-8d2e-0a4f5b6c7d8e/exports/pdf/0d9c1f9e-3f84-4f11-b6a7-2f6f7a8b9c0d.pdf"
        );
        assert_eq!(pdf, storage_path(owner, JobKind::Pdf, job));

        let image = storage_path(owner, JobKind::Image, job);
        assert!(image.contains("/exports/image/"));
        assert!(image.ends_with(".png"));
    }
}
