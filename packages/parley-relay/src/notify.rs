//! Offline notification fallback.
//!
//! When a receiver has no live connection the router hands the message to a
//! [`NotificationDispatcher`]. Dispatch is best-effort: bounded by a timeout,
//! retried a few times, and never allowed to fail the send.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

/// Characters of message content kept in a notification summary.
pub const SUMMARY_CONTENT_CHARS: usize = 100;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    Request(String),

    #[error("Notification endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivers an asynchronous notification to an offline principal.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(
        &self,
        address: &str,
        summary: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), NotifyError>;
}

/// Human-readable summary: `"<sender>: <content>"`, content truncated to
/// [`SUMMARY_CONTENT_CHARS`] characters with a trailing ellipsis.
pub fn summarize(sender_id: &str, content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(SUMMARY_CONTENT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}: {}…", sender_id, head)
    } else {
        format!("{}: {}", sender_id, head)
    }
}

/// Retry policy for [`dispatch_best_effort`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on the whole dispatch, all attempts included.
    pub timeout: Duration,
    /// Additional attempts after the first failure.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Dispatch with retries under an overall timeout. Returns the final error
/// so the caller can log it; callers must not surface it.
pub async fn dispatch_best_effort(
    dispatcher: &dyn NotificationDispatcher,
    policy: &RetryPolicy,
    address: &str,
    summary: &str,
    metadata: &BTreeMap<String, String>,
) -> Result<(), NotifyError> {
    let attempts = async {
        let mut attempt = 0u32;
        loop {
            match dispatcher.notify(address, summary, metadata).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < policy.retries => {
                    attempt += 1;
                    tracing::debug!(
                        attempt = attempt,
                        error = %e,
                        "Notification attempt failed, retrying"
                    );
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    };

    match tokio::time::timeout(policy.timeout, attempts).await {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout(policy.timeout)),
    }
}

// ── Webhook ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WebhookPayload<'a> {
    address: &'a str,
    summary: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

/// POSTs `{address, summary, metadata}` as JSON to a push gateway.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn notify(
        &self,
        address: &str,
        summary: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                address,
                summary,
                metadata,
            })
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(NotifyError::Rejected { status, body })
        }
    }
}

/// Dispatcher used when no push gateway is configured.
#[derive(Debug, Default, Clone)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify(
        &self,
        address: &str,
        summary: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            address = address,
            summary = summary,
            message_id = metadata.get("message_id").map(String::as_str).unwrap_or(""),
            "Offline notification (no gateway configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationDispatcher for Flaky {
        async fn notify(
            &self,
            _address: &str,
            _summary: &str,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                Err(NotifyError::Request("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Stuck;

    #[async_trait]
    impl NotificationDispatcher for Stuck {
        async fn notify(
            &self,
            _address: &str,
            _summary: &str,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<(), NotifyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(500),
            retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_summarize_short_content() {
        assert_eq!(summarize("alice", "hello"), "alice: hello");
    }

    #[test]
    fn test_summarize_truncates_on_char_boundary() {
        let long = "é".repeat(SUMMARY_CONTENT_CHARS + 5);
        let summary = summarize("alice", &long);
        assert!(summary.ends_with('…'));
        assert_eq!(
            summary.chars().count(),
            "alice: ".len() + SUMMARY_CONTENT_CHARS + 1
        );
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let result =
            dispatch_best_effort(&flaky, &fast_policy(2), "addr", "s", &BTreeMap::new()).await;
        assert!(result.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let result =
            dispatch_best_effort(&flaky, &fast_policy(1), "addr", "s", &BTreeMap::new()).await;
        assert!(matches!(result, Err(NotifyError::Request(_))));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_times_out() {
        let result =
            dispatch_best_effort(&Stuck, &fast_policy(0), "addr", "s", &BTreeMap::new()).await;
        assert!(matches!(result, Err(NotifyError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_log_dispatcher_always_succeeds() {
        let mut metadata = BTreeMap::new();
        metadata.insert("message_id".to_string(), "m1".to_string());
        assert!(LogDispatcher.notify("addr", "alice: hi", &metadata).await.is_ok());
    }
}
