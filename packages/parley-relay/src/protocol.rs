//! Relay protocol message definitions.
//!
//! Clients speak JSON-over-WebSocket. Every frame is an object tagged by
//! `type` (snake_case), e.g. `{"type":"send","to":"bob","content":"hi"}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Domain Records ────────────────────────────────────────────────────────────

/// A direct message between two principals.
///
/// `delivered_at` is set exactly when `delivered` is true, and a message is
/// never `read` without also being `delivered`. The store enforces both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Build a freshly admitted message. Delivered state is fused in when
    /// the receiver was observed online at admission time.
    pub fn admit(sender_id: &str, receiver_id: &str, content: &str, delivered: bool) -> Self {
        let created_at = now_millis();
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at,
            delivered,
            delivered_at: delivered.then_some(created_at),
            read: false,
            read_at: None,
        }
    }
}

/// One row of a principal's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub counterpart: String,
    /// Messages from `counterpart` to the requesting principal still unread.
    pub unread_count: u64,
    pub last_message: Option<Message>,
}

/// Current time truncated to millisecond precision, the resolution the
/// store keeps. Records compare equal before and after a round-trip.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this WebSocket connection to a principal.
    /// Must be sent first after connecting. Sending it again on the same
    /// connection re-authenticates.
    Authenticate {
        token: String,
    },

    /// Send a direct message.
    Send {
        to: String,
        content: String,
    },

    /// Mark every unread message from `counterpart` as read.
    MarkRead {
        counterpart: String,
    },

    /// Request the conversation list.
    ListConversations,

    /// Request a page of history with one counterpart.
    FetchHistory {
        counterpart: String,
        #[serde(default)]
        limit: Option<usize>,
        /// Only messages older than this one (the first message of the
        /// previous page).
        #[serde(default)]
        before_id: Option<Uuid>,
    },

    /// Ping to keep connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of successful authentication.
    Authenticated {
        principal_id: String,
        privileged: bool,
    },

    /// A message addressed to (or sent by) this principal.
    Message {
        message: Message,
    },

    /// Delivery confirmation for a message this principal sent.
    MessageDelivered {
        message_id: Uuid,
        delivered_at: DateTime<Utc>,
    },

    /// `reader_id` read `count` messages this principal had sent them.
    MessagesRead {
        reader_id: String,
        count: u64,
        read_at: DateTime<Utc>,
    },

    /// Unread messages from `counterpart` to this principal.
    UnreadCount {
        counterpart: String,
        count: u64,
    },

    /// Response to ListConversations.
    Conversations {
        conversations: Vec<ConversationSummary>,
    },

    /// Response to FetchHistory, oldest first.
    History {
        counterpart: String,
        messages: Vec<Message>,
    },

    /// The send was admitted and persisted.
    SendAck {
        message_id: Uuid,
    },

    /// Response to MarkRead.
    MarkReadAck {
        counterpart: String,
        count: u64,
    },

    /// This connection was superseded by a newer authentication of the
    /// same principal and no longer receives routed traffic.
    SessionReplaced,

    /// Pong response to keep connection alive.
    Pong,

    /// Error response.
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    /// Error frame for a relay error, hiding internal details.
    pub fn from_error(err: &crate::error::RelayError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.client_message(),
        }
    }
}
