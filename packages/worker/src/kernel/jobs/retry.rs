//! Error classification and the exponential backoff decision.
//!
//! This is the only place that inspects raw error text; everything else in
//! the worker moves typed errors around. The `user_message` produced here
//! is the only string that may reach an end user.

use super::processor::ProcessError;
use crate::kernel::extract::ExtractError;
use crate::kernel::render::RenderError;
use crate::kernel::storage::StorageError;
use crate::kernel::jobs::store::StoreError;
use crate::domains::menu::TemplateError;

pub const MAX_RETRIES: i32 = 3;
pub const BACKOFF_BASE_SECS: i64 = 10;
pub const BACKOFF_CAP_SECS: i64 = 300;

/// Substrings that mark a transport-level failure wherever it surfaces.
const TRANSIENT_NETWORK_TOKENS: &[&str] = &[
    "econnrefused",
    "etimedout",
    "econnreset",
    "enotfound",
    "socket hang up",
    "fetch failed",
    "connection pool exhausted",
    "connection reset",
    "broken pipe",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    TransientNetwork,
    TransientStorage,
    TransientRender,
    PermanentValidation,
    PermanentInput,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::TransientNetwork
                | ErrorCategory::TransientStorage
                | ErrorCategory::TransientRender
        )
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub category: ErrorCategory,
    /// Bounded, safe summary suitable for surfacing via email.
    pub user_message: String,
    /// Full diagnostics; goes only to structured logs and the job row's
    /// mid-retry error field.
    pub internal_message: String,
}

#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub retry_delay_seconds: i64,
    pub classification: Classification,
}

/// `min(BASE * 2^retry_count, CAP)`; the cap wins over growth.
pub fn backoff_delay_seconds(retry_count: i32) -> i64 {
    let exponent = retry_count.clamp(0, 30) as u32;
    BACKOFF_BASE_SECS
        .saturating_mul(1i64 << exponent)
        .min(BACKOFF_CAP_SECS)
}

pub fn classify(err: &ProcessError) -> Classification {
    let internal_message = truncate(&err.to_string(), 500);
    let category = category_of(err);
    Classification {
        user_message: user_message_for(category).to_string(),
        internal_message,
        category,
    }
}

/// The full retry decision for a failure observed at `retry_count`.
pub fn decide(err: &ProcessError, retry_count: i32) -> RetryDecision {
    let classification = classify(err);
    let should_retry = classification.category.is_retryable() && retry_count < MAX_RETRIES;
    RetryDecision {
        should_retry,
        retry_delay_seconds: backoff_delay_seconds(retry_count),
        classification,
    }
}

fn category_of(err: &ProcessError) -> ErrorCategory {
    match err {
        ProcessError::Snapshot(_) => ErrorCategory::PermanentValidation,
        ProcessError::Template(TemplateError::UntrustedImageUrl(_)) => {
            ErrorCategory::PermanentValidation
        }
        ProcessError::Template(TemplateError::UnknownTemplate(_)) => ErrorCategory::PermanentInput,
        ProcessError::Render(RenderError::Launch(_) | RenderError::Timeout(_)) => {
            ErrorCategory::TransientRender
        }
        ProcessError::Render(other) => {
            if looks_transient(&other.to_string()) {
                ErrorCategory::TransientNetwork
            } else {
                ErrorCategory::TransientRender
            }
        }
        ProcessError::InvalidOutput(_) => ErrorCategory::PermanentValidation,
        ProcessError::Storage(StorageError::Unavailable) => ErrorCategory::TransientStorage,
        ProcessError::Storage(StorageError::Status { status, .. }) => {
            if *status >= 500 {
                ErrorCategory::TransientStorage
            } else {
                ErrorCategory::PermanentInput
            }
        }
        ProcessError::Storage(StorageError::Transport(message)) => {
            if looks_transient(message) {
                ErrorCategory::TransientNetwork
            } else {
                ErrorCategory::TransientStorage
            }
        }
        ProcessError::Storage(StorageError::InvalidResponse(_)) => ErrorCategory::TransientStorage,
        ProcessError::Store(StoreError::Database(_) | StoreError::Unavailable(_)) => {
            ErrorCategory::TransientNetwork
        }
        ProcessError::Store(StoreError::Conflict(_)) => ErrorCategory::PermanentInput,
        ProcessError::Extraction(ExtractError::Transient(_)) => ErrorCategory::TransientNetwork,
        ProcessError::Extraction(ExtractError::Permanent(_)) => ErrorCategory::PermanentInput,
        ProcessError::MissingSourceImage => ErrorCategory::PermanentInput,
    }
}

fn user_message_for(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::TransientNetwork | ErrorCategory::TransientStorage => {
            "We couldn't finish your export after several attempts because of a temporary \
             service problem. Please try again later."
        }
        ErrorCategory::TransientRender => {
            "We couldn't finish rendering your export after several attempts. Please try \
             again later."
        }
        ErrorCategory::PermanentValidation => {
            "The export could not be generated from this menu. Please review the menu \
             content and try again."
        }
        ErrorCategory::PermanentInput => {
            "This export request is invalid and could not be processed. Please re-create \
             the export."
        }
    }
}

fn looks_transient(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_NETWORK_TOKENS
        .iter()
        .any(|token| lowered.contains(token))
}

fn truncate(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut cut = max;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &message[..cut])
}
