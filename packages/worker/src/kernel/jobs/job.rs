//! Job model for durable export and extraction work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::id::new_job_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Pdf,
    Image,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Pdf => "pdf",
            JobKind::Image => "image",
        }
    }

    /// File extension of the artifact at the deterministic storage path.
    pub fn extension(&self) -> &'static str {
        match self {
            JobKind::Pdf => "pdf",
            JobKind::Image => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            JobKind::Pdf => "application/pdf",
            JobKind::Image => "image/png",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_family", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobFamily {
    #[default]
    Export,
    Extraction,
}

impl JobFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFamily::Export => "export",
            JobFamily::Extraction => "extraction",
        }
    }
}

/// One durable request to produce an artifact for one user.
///
/// Rows are created by the enqueuing web tier; worker replicas compete for
/// them via the atomic claim. `available_at` is the only gate on claim
/// eligibility for pending rows.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = new_job_id())]
    pub id: Uuid,
    pub owner_id: Uuid,
    pub target_id: Uuid,
    #[builder(default)]
    pub family: JobFamily,
    pub kind: JobKind,
    #[builder(default)]
    pub state: JobState,
    #[builder(default = 10)]
    pub priority: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = Utc::now())]
    pub available_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub storage_path: Option<String>,
    #[builder(default, setter(strip_option))]
    pub artifact_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Friendly name the owner gave this export, when present.
    pub fn display_name(&self) -> Option<&str> {
        self.metadata.get("display_name").and_then(|v| v.as_str())
    }

    /// Source image for extraction jobs.
    pub fn source_image_url(&self) -> Option<&str> {
        self.metadata
            .get("source_image_url")
            .and_then(|v| v.as_str())
    }
}

/// Aggregate queue counters for operators.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed_24h: i64,
    pub failed_24h: i64,
    pub avg_processing_seconds: f64,
    pub oldest_pending_seconds: f64,
}

/// Completed row slated for retention cleanup.
#[derive(FromRow, Debug, Clone)]
pub struct CompletedArtifact {
    pub id: Uuid,
    pub storage_path: Option<String>,
}
