//! Server state management.
//!
//! Wires the message store, presence directory and the four core services
//! together. Cloning a `RelayState` is cheap and every clone shares the same
//! directory and store.

use std::sync::Arc;
use std::time::Duration;

use crate::conversations::ConversationAggregator;
use crate::identity::IdentityProvider;
use crate::lifecycle::ConnectionLifecycle;
use crate::notify::{NotificationDispatcher, RetryPolicy};
use crate::presence::PresenceDirectory;
use crate::receipts::ReadReceiptEngine;
use crate::router::{DeliveryRouter, DEFAULT_MAX_CONTENT_CHARS};
use crate::store::MessageStore;

/// Default notification timeout, all retries included.
const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 5000;

/// Default retries after a failed notification attempt.
const DEFAULT_NOTIFY_RETRIES: u32 = 2;

/// Default pause before the first notification retry (grows linearly).
const DEFAULT_NOTIFY_BACKOFF_MS: u64 = 250;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// SQLite file for the message log. None keeps it in memory.
    pub database_path: Option<String>,
    /// Maximum message length, in characters.
    pub max_content_chars: usize,
    pub notify_timeout: Duration,
    pub notify_retries: u32,
    pub notify_backoff: Duration,
    /// Human-readable region label (e.g. "US East", "EU West")
    pub region: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_path: None,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            notify_timeout: Duration::from_millis(DEFAULT_NOTIFY_TIMEOUT_MS),
            notify_retries: DEFAULT_NOTIFY_RETRIES,
            notify_backoff: Duration::from_millis(DEFAULT_NOTIFY_BACKOFF_MS),
            region: "US East".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.notify_timeout,
            retries: self.notify_retries,
            backoff: self.notify_backoff,
        }
    }

    /// Timeout for a single notification request: an even share of the
    /// overall budget across the first attempt and every retry.
    pub fn notify_request_timeout(&self) -> Duration {
        self.notify_timeout / (self.notify_retries + 1)
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Server configuration.
    pub config: RelayConfig,

    /// Durable message log.
    pub store: MessageStore,

    /// Principal → live connection. Owned by the lifecycle manager, shared
    /// read-mostly with the router and receipt engine.
    pub presence: Arc<PresenceDirectory>,

    /// Authenticate / disconnect bookkeeping.
    pub lifecycle: Arc<ConnectionLifecycle>,

    pub router: DeliveryRouter,
    pub receipts: ReadReceiptEngine,
    pub conversations: ConversationAggregator,
}

impl RelayState {
    /// Create a new relay state with the given configuration and collaborators.
    pub fn new(
        config: RelayConfig,
        store: MessageStore,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let presence = Arc::new(PresenceDirectory::new());
        let lifecycle = Arc::new(ConnectionLifecycle::new(presence.clone(), identity.clone()));
        let router = DeliveryRouter::new(
            store.clone(),
            presence.clone(),
            identity,
            notifier,
            config.max_content_chars,
            config.retry_policy(),
        );
        let receipts = ReadReceiptEngine::new(store.clone(), presence.clone());
        let conversations = ConversationAggregator::new(store.clone());

        Self {
            config,
            store,
            presence,
            lifecycle,
            router,
            receipts,
            conversations,
        }
    }

    /// Get the number of principals currently online.
    pub fn online_count(&self) -> usize {
        self.presence.online_count()
    }

    /// Get the number of connections listening on the staff inbox.
    pub fn privileged_listener_count(&self) -> usize {
        self.presence.privileged_count()
    }

    /// Total stored messages, for the stats endpoint.
    pub async fn stored_message_count(&self) -> crate::error::Result<u64> {
        self.store.call(|db| db.count()).await
    }
}
