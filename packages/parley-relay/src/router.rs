//! Delivery router.
//!
//! Admits a message, persists it, then decides between live fan-out and the
//! offline notification fallback:
//!
//! ```text
//! send(sender, receiver, content)
//!   │ validate (self-send, content, receiver exists)
//!   │ presence.lookup(receiver) ──► online?
//!   │ store.insert(message { delivered: online })      ◄─ fails the send on error
//!   ├── online:  receiver ← message
//!   │            sender   ← message, message_delivered
//!   │            receiver ← unread_count(sender)
//!   └── offline: sender   ← message
//!                spawn dispatcher.notify(address, summary, metadata)   ◄─ best-effort
//! ```
//!
//! The offline notification runs in its own task; `send` returns as soon as
//! the message is stored and the live emissions are queued.
//!
//! Persistence completes before any emission, and each connection task
//! handles its frames one at a time, so messages from one sender to one
//! receiver are emitted in the order they were stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::ConnectionHandle;
use crate::error::{RelayError, Result};
use crate::identity::{IdentityProvider, Principal};
use crate::notify::{dispatch_best_effort, summarize, NotificationDispatcher, RetryPolicy};
use crate::presence::PresenceDirectory;
use crate::protocol::{Message, ServerMessage};
use crate::store::MessageStore;

/// Default maximum message length, in characters.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 2000;

#[derive(Clone)]
pub struct DeliveryRouter {
    store: MessageStore,
    presence: Arc<PresenceDirectory>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn NotificationDispatcher>,
    max_content_chars: usize,
    retry: RetryPolicy,
}

impl DeliveryRouter {
    pub fn new(
        store: MessageStore,
        presence: Arc<PresenceDirectory>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn NotificationDispatcher>,
        max_content_chars: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            presence,
            identity,
            notifier,
            max_content_chars,
            retry,
        }
    }

    /// Admit, persist and route one direct message.
    ///
    /// Not idempotent: every successful call stores a new message.
    pub async fn send(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<Message> {
        if sender_id == receiver_id {
            return Err(RelayError::InvalidRecipient);
        }

        let content = content.trim();
        if content.is_empty() {
            return Err(RelayError::ContentInvalid(
                "Message content is empty".to_string(),
            ));
        }
        if content.chars().count() > self.max_content_chars {
            return Err(RelayError::ContentInvalid(format!(
                "Message content exceeds {} characters",
                self.max_content_chars
            )));
        }

        let receiver = self
            .identity
            .resolve(receiver_id)
            .await?
            .ok_or_else(|| RelayError::RecipientNotFound(receiver_id.to_string()))?;

        // Receiver observed online here gets the delivered flag fused into
        // the insert. A disconnect after this point still leaves the flag set.
        let receiver_conn = self.presence.lookup(receiver_id);
        let message = Message::admit(sender_id, receiver_id, content, receiver_conn.is_some());

        let record = message.clone();
        if let Err(e) = self.store.call(move |db| db.insert(&record)).await {
            tracing::error!(
                message_id = %message.id,
                from = sender_id,
                to = receiver_id,
                error = %e,
                "Failed to persist message"
            );
            return Err(e);
        }

        let sender_conn = self.presence.lookup(sender_id);
        if let Some(ref conn) = sender_conn {
            conn.emit(ServerMessage::Message {
                message: message.clone(),
            });
        }

        match receiver_conn {
            Some(ref conn) => self.deliver_live(conn, sender_conn.as_ref(), &message).await,
            None => self.notify_offline(&receiver, &message),
        }

        if receiver.privileged {
            self.mirror_to_staff(&message, receiver_conn.as_ref(), sender_conn.as_ref());
        }

        Ok(message)
    }

    async fn deliver_live(
        &self,
        receiver_conn: &ConnectionHandle,
        sender_conn: Option<&ConnectionHandle>,
        message: &Message,
    ) {
        if !receiver_conn.emit(ServerMessage::Message {
            message: message.clone(),
        }) {
            // Accepted race: receiver went away after the presence lookup.
            tracing::debug!(
                message_id = %message.id,
                to = message.receiver_id.as_str(),
                "Receiver connection closed during delivery"
            );
        }

        if let (Some(conn), Some(delivered_at)) = (sender_conn, message.delivered_at) {
            conn.emit(ServerMessage::MessageDelivered {
                message_id: message.id,
                delivered_at,
            });
        }

        let receiver_id = message.receiver_id.clone();
        let sender_id = message.sender_id.clone();
        match self
            .store
            .call(move |db| db.unread_count(&receiver_id, &sender_id))
            .await
        {
            Ok(count) => {
                receiver_conn.emit(ServerMessage::UnreadCount {
                    counterpart: message.sender_id.clone(),
                    count,
                });
            }
            Err(e) => {
                tracing::warn!(
                    to = message.receiver_id.as_str(),
                    error = %e,
                    "Failed to compute unread count after delivery"
                );
            }
        }

        tracing::debug!(
            message_id = %message.id,
            from = message.sender_id.as_str(),
            to = message.receiver_id.as_str(),
            "Message delivered live"
        );
    }

    fn notify_offline(&self, receiver: &Principal, message: &Message) {
        let Some(address) = receiver.notify_address.as_deref() else {
            tracing::debug!(
                message_id = %message.id,
                to = receiver.id.as_str(),
                "Receiver offline with no notification address"
            );
            return;
        };

        let summary = summarize(&message.sender_id, &message.content);
        let mut metadata = BTreeMap::new();
        metadata.insert("message_id".to_string(), message.id.to_string());
        metadata.insert("sender_id".to_string(), message.sender_id.clone());
        metadata.insert("kind".to_string(), "direct_message".to_string());

        let notifier = self.notifier.clone();
        let retry = self.retry.clone();
        let address = address.to_string();
        let message_id = message.id;
        let receiver_id = receiver.id.clone();

        tokio::spawn(async move {
            match dispatch_best_effort(notifier.as_ref(), &retry, &address, &summary, &metadata)
                .await
            {
                Ok(()) => {
                    tracing::debug!(
                        message_id = %message_id,
                        to = receiver_id.as_str(),
                        "Offline notification dispatched"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %message_id,
                        to = receiver_id.as_str(),
                        error = %e,
                        "Offline notification failed"
                    );
                }
            }
        });
    }

    /// Messages to a privileged principal land in the shared staff inbox:
    /// every other privileged listener gets a copy.
    fn mirror_to_staff(
        &self,
        message: &Message,
        receiver_conn: Option<&ConnectionHandle>,
        sender_conn: Option<&ConnectionHandle>,
    ) {
        let skip: Vec<_> = receiver_conn
            .into_iter()
            .chain(sender_conn)
            .map(|c| c.id())
            .collect();

        for listener in self.presence.privileged_listeners() {
            if skip.contains(&listener.id()) {
                continue;
            }
            listener.emit(ServerMessage::Message {
                message: message.clone(),
            });
        }
    }
}
