//! Outcome notifications, delivered through an email webhook.
//!
//! Strictly best-effort: a notifier must never fail a job. Implementations
//! log delivery problems and swallow them.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::kernel::jobs::JobKind;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell the owner their export is ready for download.
    async fn send_completion(
        &self,
        owner_id: Uuid,
        signed_url: &str,
        display_name: &str,
        kind: JobKind,
    );

    /// Tell the owner their export failed terminally. `user_message` is the
    /// bounded, safe summary from the retry policy, never raw diagnostics.
    async fn send_failure(
        &self,
        owner_id: Uuid,
        display_name: &str,
        kind: JobKind,
        user_message: &str,
    );
}

/// Posts notification events to the deployment's mailer webhook.
pub struct WebhookNotifier {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct NotificationPayload<'a> {
    event: &'a str,
    owner_id: Uuid,
    display_name: &'a str,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build notifier HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.map(str::to_string),
        })
    }

    async fn post(&self, payload: NotificationPayload<'_>) {
        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(event = payload.event, owner_id = %payload.owner_id, "notification sent");
            }
            Ok(response) => {
                warn!(
                    event = payload.event,
                    owner_id = %payload.owner_id,
                    status = response.status().as_u16(),
                    "notifier webhook rejected the event"
                );
            }
            Err(err) => {
                warn!(
                    event = payload.event,
                    owner_id = %payload.owner_id,
                    error = %err,
                    "failed to reach notifier webhook"
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_completion(
        &self,
        owner_id: Uuid,
        signed_url: &str,
        display_name: &str,
        kind: JobKind,
    ) {
        self.post(NotificationPayload {
            event: "export_completed",
            owner_id,
            display_name,
            kind: kind.as_str(),
            download_url: Some(signed_url),
            message: None,
        })
        .await;
    }

    async fn send_failure(
        &self,
        owner_id: Uuid,
        display_name: &str,
        kind: JobKind,
        user_message: &str,
    ) {
        self.post(NotificationPayload {
            event: "export_failed",
            owner_id,
            display_name,
            kind: kind.as_str(),
            download_url: None,
            message: Some(user_message),
        })
        .await;
    }
}

/// Used when no webhook is configured; outcomes are only logged.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_completion(
        &self,
        owner_id: Uuid,
        _signed_url: &str,
        display_name: &str,
        kind: JobKind,
    ) {
        debug!(owner_id = %owner_id, display_name, kind = kind.as_str(), "completion notification dropped (no notifier configured)");
    }

    async fn send_failure(
        &self,
        owner_id: Uuid,
        display_name: &str,
        kind: JobKind,
        _user_message: &str,
    ) {
        debug!(owner_id = %owner_id, display_name, kind = kind.as_str(), "failure notification dropped (no notifier configured)");
    }
}
