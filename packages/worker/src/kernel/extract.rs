//! Collaborator seam for the extraction job family.
//!
//! Extraction turns an uploaded menu photo into structured menu JSON. The
//! heavy lifting lives outside this service; the worker only resolves the
//! image URL from the job metadata and hands it to this trait.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Upstream hiccup; the job may be retried.
    #[error("extraction temporarily failed: {0}")]
    Transient(String),
    /// The input can never extract; the job is terminal.
    #[error("extraction rejected the input: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait MenuExtractor: Send + Sync {
    async fn extract(&self, image_url: &str) -> Result<serde_json::Value, ExtractError>;
}
