//! Test harness shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;
use crate::identity::{Principal, TokenDirectory};
use crate::notify::{NotificationDispatcher, NotifyError};
use crate::protocol::ServerMessage;
use crate::state::{RelayConfig, RelayState};
use crate::store::MessageStore;

#[derive(Debug, Clone)]
pub struct NotifyCall {
    pub address: String,
    pub summary: String,
    pub metadata: BTreeMap<String, String>,
}

/// Records every dispatch; optionally fails all of them.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifyCall>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<NotifyCall> {
        self.calls.lock().clone()
    }

    /// Dispatches run in spawned tasks; wait until `n` have been recorded
    /// (or two seconds pass) and return everything seen so far.
    pub async fn wait_for_calls(&self, n: usize) -> Vec<NotifyCall> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let calls = self.calls();
            if calls.len() >= n || tokio::time::Instant::now() >= deadline {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn notify(
        &self,
        address: &str,
        summary: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), NotifyError> {
        self.calls.lock().push(NotifyCall {
            address: address.to_string(),
            summary: summary.to_string(),
            metadata: metadata.clone(),
        });
        if self.fail {
            Err(NotifyError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Principals: alice, bob (both with push addresses), carol (no address),
/// staff and lead (privileged). Each authenticates with `<id>-token`.
pub fn directory() -> TokenDirectory {
    let mut dir = TokenDirectory::new();
    dir.insert(Principal::new("alice").with_notify_address("push:alice"), "alice-token");
    dir.insert(Principal::new("bob").with_notify_address("push:bob"), "bob-token");
    dir.insert(Principal::new("carol"), "carol-token");
    dir.insert(Principal::new("staff").privileged(), "staff-token");
    dir.insert(Principal::new("lead").privileged(), "lead-token");
    dir
}

pub struct Harness {
    pub state: RelayState,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Notifier rejects everything; one retry is allowed.
    pub fn with_failing_notifier() -> Self {
        Self::build(true)
    }

    fn build(fail: bool) -> Self {
        let notifier = Arc::new(RecordingNotifier {
            calls: Mutex::new(Vec::new()),
            fail,
        });
        let config = RelayConfig {
            notify_timeout: Duration::from_secs(2),
            notify_retries: 1,
            notify_backoff: Duration::from_millis(1),
            ..RelayConfig::default()
        };
        let store = MessageStore::open(None).expect("in-memory store");
        let state = RelayState::new(config, store, Arc::new(directory()), notifier.clone());
        Self { state, notifier }
    }

    /// Open a connection and authenticate it as `principal_id`.
    pub async fn connect(
        &self,
        principal_id: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (conn, rx) = ConnectionHandle::channel();
        self.state
            .lifecycle
            .on_authenticate(&conn, &format!("{}-token", principal_id))
            .await
            .expect("known test principal");
        (conn, rx)
    }

    pub fn stored(&self) -> u64 {
        self.state.store.count().expect("count")
    }
}

/// Everything currently queued on a connection.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}
