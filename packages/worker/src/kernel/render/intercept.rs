//! Request allowlisting for render pages.
//!
//! Menu HTML is authored by end users, so the render environment must not
//! fetch from arbitrary origins and must never resolve `file://` URLs. The
//! policy permits `data:` URLs plus hosts matching an operator-configured
//! list of content-domain suffixes; everything else is blocked.

use std::sync::Arc;

use headless_chrome::browser::tab::{RequestInterceptor, RequestPausedDecision};
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::{events::RequestPausedEvent, FailRequest};
use headless_chrome::protocol::cdp::Network::ErrorReason;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct UrlPolicy {
    allowed_suffixes: Vec<String>,
}

impl UrlPolicy {
    pub fn new(suffixes: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_suffixes: suffixes
                .into_iter()
                .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Whether a render page may load this URL.
    pub fn allows(&self, raw: &str) -> bool {
        let parsed = match Url::parse(raw.trim()) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        // Url::parse lowercases the scheme, which covers FILE:// variants.
        match parsed.scheme() {
            "data" => true,
            "file" => false,
            _ => match parsed.host_str() {
                Some(host) => {
                    let host = host.to_ascii_lowercase();
                    self.allowed_suffixes
                        .iter()
                        .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
                }
                None => false,
            },
        }
    }
}

/// Adapter that applies a [`UrlPolicy`] to paused browser requests.
pub struct AllowlistInterceptor {
    policy: UrlPolicy,
}

impl AllowlistInterceptor {
    pub fn new(policy: UrlPolicy) -> Arc<Self> {
        Arc::new(Self { policy })
    }
}

impl RequestInterceptor for AllowlistInterceptor {
    fn intercept(
        &self,
        _transport: Arc<Transport>,
        _session_id: SessionId,
        event: RequestPausedEvent,
    ) -> RequestPausedDecision {
        let url = &event.params.request.url;
        if self.policy.allows(url) {
            RequestPausedDecision::Continue(None)
        } else {
            debug!(url = %url, "blocked render request");
            RequestPausedDecision::Fail(FailRequest {
                request_id: event.params.request_id,
                error_reason: ErrorReason::BlockedByClient,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> UrlPolicy {
        UrlPolicy::new(["cdn.example.com".to_string(), "example.org".to_string()])
    }

    #[test]
    fn data_urls_are_always_allowed() {
        assert!(UrlPolicy::default().allows("data:text/html;base64,PGI+"));
        assert!(policy().allows("data:image/png;base64,iVBOR"));
    }

    #[test]
    fn file_urls_are_blocked_case_insensitively() {
        assert!(!policy().allows("file:///etc/passwd"));
        assert!(!policy().allows("FILE:///etc/passwd"));
        assert!(!policy().allows("File:///C:/secrets.txt"));
    }

    #[test]
    fn allowlisted_suffixes_match_exact_and_subdomains() {
        assert!(policy().allows("https://cdn.example.com/menu/1.png"));
        assert!(policy().allows("https://eu.cdn.example.com/menu/1.png"));
        assert!(policy().allows("https://files.example.org/x"));
    }

    #[test]
    fn suffix_match_does_not_leak_across_registrable_domains() {
        // evilcdn.example.com.attacker.net must not match cdn.example.com
        assert!(!policy().allows("https://cdn.example.com.attacker.net/x"));
        assert!(!policy().allows("https://notexample.org/x"));
    }

    #[test]
    fn other_origins_are_blocked() {
        assert!(!policy().allows("https://attacker.net/payload.css"));
        assert!(!policy().allows("http://169.254.169.254/latest/meta-data"));
        assert!(!policy().allows("not a url"));
    }

    #[test]
    fn empty_policy_is_closed_except_data() {
        let closed = UrlPolicy::default();
        assert!(!closed.allows("https://cdn.example.com/x.png"));
        assert!(closed.allows("data:,hello"));
    }
}
