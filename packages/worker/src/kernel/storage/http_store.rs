//! Blob-storage gateway client using direct HTTP calls.
//!
//! Talks to an object gateway (`STORE_URL`) authenticated with a service
//! credential. Object paths live under a bucket; uploads are upserts so a
//! retry that re-renders a job overwrites the same object.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kernel::metrics::Metrics;

use super::breaker::CircuitBreaker;
use super::{BlobEntry, BlobStore, StorageError};

const LIST_BATCH_LIMIT: usize = 1_000;

pub struct HttpBlobStore {
    client: Client,
    base_url: String,
    public_base_url: Option<String>,
    bucket: String,
    service_key: String,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
}

#[derive(Serialize)]
struct SignRequest {
    expires_in: u64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(alias = "signedURL")]
    signed_url: String,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
}

impl HttpBlobStore {
    pub fn new(
        base_url: &str,
        public_base_url: Option<&str>,
        bucket: &str,
        service_key: &str,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build storage HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
            bucket: bucket.to_string(),
            service_key: service_key.to_string(),
            breaker: CircuitBreaker::default(),
            metrics,
        })
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Origin presented to end users. Signed URLs are rewritten onto it when
    /// the gateway is only reachable under a container-internal DNS name.
    fn public_origin(&self) -> &str {
        self.public_base_url.as_deref().unwrap_or(&self.base_url)
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/object/{}/{}", self.base_url, self.bucket, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(512);
        Err(StorageError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn upload_inner(
        &self,
        bytes: &[u8],
        path: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .client
            .post(self.object_url(path))
            .bearer_auth(&self.service_key)
            .header("content-type", content_type)
            .header("x-upsert", "true")
            .body(bytes.to_vec())
            .send()
            .await?;
        Self::check_status(response).await?;

        Ok(format!(
            "{}/object/public/{}/{}",
            self.public_origin(),
            self.bucket,
            path
        ))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(
        &self,
        bytes: &[u8],
        path: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.breaker.check()?;

        match self.upload_inner(bytes, path, content_type).await {
            Ok(url) => {
                self.breaker.on_success();
                self.metrics.storage_breaker_open.set(0);
                Ok(url)
            }
            Err(err) => {
                self.breaker.on_failure();
                if self.breaker.is_open() {
                    warn!(path, "storage upload circuit is open");
                    self.metrics.storage_breaker_open.set(1);
                }
                Err(err)
            }
        }
    }

    async fn signed_url(
        &self,
        path: &str,
        ttl_seconds: u64,
        download_filename: Option<&str>,
    ) -> Result<String, StorageError> {
        let response = self
            .client
            .post(format!(
                "{}/object/sign/{}/{}",
                self.base_url, self.bucket, path
            ))
            .bearer_auth(&self.service_key)
            .json(&SignRequest {
                expires_in: ttl_seconds,
            })
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| StorageError::InvalidResponse(e.to_string()))?;

        // The gateway answers with a path relative to its own origin.
        let mut url = if signed.signed_url.starts_with("http") {
            signed.signed_url
        } else {
            format!(
                "{}/{}",
                self.public_origin(),
                signed.signed_url.trim_start_matches('/')
            )
        };

        if let Some(filename) = download_filename {
            let encoded: String =
                url::form_urlencoded::byte_serialize(filename.as_bytes()).collect();
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push(separator);
            url.push_str("download=");
            url.push_str(&encoded);
        }

        Ok(url)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .delete(self.object_url(path))
            .bearer_auth(&self.service_key)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<BlobEntry>, StorageError> {
        let response = self
            .client
            .post(format!("{}/object/list/{}", self.base_url, self.bucket))
            .bearer_auth(&self.service_key)
            .json(&ListRequest { prefix, limit })
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let entries: Vec<ListEntry> = response
            .json()
            .await
            .map_err(|e| StorageError::InvalidResponse(e.to_string()))?;

        Ok(entries
            .into_iter()
            .map(|e| BlobEntry {
                name: e.name,
                created_at: e.created_at,
            })
            .collect())
    }

    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
        let entries = self.list("", LIST_BATCH_LIMIT).await?;
        if entries.len() == LIST_BATCH_LIMIT {
            debug!("retention delete batch is full; remainder handled next sweep");
        }

        let mut deleted = 0u64;
        for entry in entries {
            let old_enough = entry.created_at.map(|ts| ts < before).unwrap_or(false);
            if !old_enough {
                continue;
            }
            match self.delete(&entry.name).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(object = %entry.name, error = %err, "failed to delete expired object"),
            }
        }
        Ok(deleted)
    }
}
