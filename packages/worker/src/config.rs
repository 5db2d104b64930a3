//! Worker configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::common::id::default_worker_id;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres DSN for the relational job store.
    pub database_url: String,
    /// Blob-storage gateway endpoint.
    pub store_url: String,
    /// Service credential for the blob-storage gateway.
    pub store_key: String,
    /// Target bucket for export artifacts.
    pub blob_bucket: String,
    /// External origin substituted into signed URLs when the gateway is
    /// only reachable under a container-internal DNS name.
    pub public_store_url: Option<String>,
    /// Opaque identifier written into `job.worker_id` on claim.
    pub worker_id: String,
    /// Render pool capacity.
    pub max_renders: usize,
    /// Hard timeout for a single render.
    pub job_timeout: Duration,
    /// Poll delay when the queue has eligible work but our claim lost.
    pub poll_busy: Duration,
    /// Poll delay when the queue is empty.
    pub poll_idle: Duration,
    /// Budget for the current job to finish after a shutdown signal.
    pub shutdown_timeout: Duration,
    pub health_port: u16,
    pub metrics_port: u16,
    /// Run the render canary at startup.
    pub enable_canary: bool,
    /// Extra attempts for transient job-store transport failures.
    pub db_max_retries: u32,
    pub db_retry_delay: Duration,
    /// Headless browser executable; platform default when unset.
    pub browser_executable: Option<PathBuf>,
    /// Content-domain suffixes renders may fetch from. Closed by default:
    /// with an empty list only `data:` URLs load.
    pub allowed_content_hosts: Vec<String>,
    /// Claim the extraction family before exports.
    pub enable_extraction: bool,
    /// Notifier webhook; unset means notifications are dropped.
    pub notify_url: Option<String>,
    pub notify_key: Option<String>,
    /// Enqueuer-side validation limits, documented here for the collaborator.
    pub max_export_html_size: usize,
    pub max_export_image_count: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Split out from
    /// [`Config::from_env`] so tests do not have to mutate process state.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            database_url: get("DATABASE_URL").context("DATABASE_URL must be set")?,
            store_url: get("STORE_URL")
                .context("STORE_URL must be set")?
                .trim_end_matches('/')
                .to_string(),
            store_key: get("STORE_KEY").context("STORE_KEY must be set")?,
            blob_bucket: get("BLOB_BUCKET").context("BLOB_BUCKET must be set")?,
            public_store_url: get("PUBLIC_STORE_URL").map(|u| u.trim_end_matches('/').to_string()),
            worker_id: get("WORKER_ID").unwrap_or_else(default_worker_id),
            max_renders: parse_or(&get, "MAX_RENDERS", 3)?,
            job_timeout: Duration::from_secs(parse_or(&get, "JOB_TIMEOUT_SECONDS", 60)?),
            poll_busy: Duration::from_millis(parse_or(&get, "POLL_BUSY_MS", 2_000)?),
            poll_idle: Duration::from_millis(parse_or(&get, "POLL_IDLE_MS", 5_000)?),
            shutdown_timeout: Duration::from_millis(parse_or(&get, "SHUTDOWN_TIMEOUT_MS", 30_000)?),
            health_port: parse_or(&get, "HEALTH_PORT", 3_000)?,
            metrics_port: parse_or(&get, "METRICS_PORT", 9_090)?,
            enable_canary: parse_or(&get, "ENABLE_CANARY", true)?,
            db_max_retries: parse_or(&get, "DB_MAX_RETRIES", 3)?,
            db_retry_delay: Duration::from_millis(parse_or(&get, "DB_RETRY_DELAY_MS", 1_000)?),
            browser_executable: get("BROWSER_EXECUTABLE").map(PathBuf::from),
            allowed_content_hosts: get("ALLOWED_CONTENT_HOSTS")
                .map(|raw| {
                    raw.split(',')
                        .map(|h| h.trim().to_ascii_lowercase())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            enable_extraction: parse_or(&get, "ENABLE_EXTRACTION", false)?,
            notify_url: get("NOTIFY_URL"),
            notify_key: get("NOTIFY_KEY"),
            max_export_html_size: parse_or(&get, "MAX_EXPORT_HTML_SIZE", 5_242_880)?,
            max_export_image_count: parse_or(&get, "MAX_EXPORT_IMAGE_COUNT", 100)?,
        })
    }
}

fn parse_or<T>(get: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}
