//! Read-receipt engine.
//!
//! Flips every unread message from one counterpart to read in a single
//! conditional update, then tells both sides.

use std::sync::Arc;

use crate::error::Result;
use crate::presence::PresenceDirectory;
use crate::protocol::{now_millis, ServerMessage};
use crate::store::MessageStore;

#[derive(Clone)]
pub struct ReadReceiptEngine {
    store: MessageStore,
    presence: Arc<PresenceDirectory>,
}

impl ReadReceiptEngine {
    pub fn new(store: MessageStore, presence: Arc<PresenceDirectory>) -> Self {
        Self { store, presence }
    }

    /// Mark all unread messages `counterpart → reader` as read.
    ///
    /// Returns how many messages this call transitioned; 0 is not an error
    /// and emits nothing. Otherwise the counterpart gets `messages_read` and
    /// the reader gets a zeroed `unread_count`.
    pub async fn mark_read(&self, reader_id: &str, counterpart_id: &str) -> Result<u64> {
        let read_at = now_millis();
        let reader = reader_id.to_string();
        let counterpart = counterpart_id.to_string();
        let count = self
            .store
            .call(move |db| db.mark_read(&reader, &counterpart, read_at))
            .await? as u64;

        if count == 0 {
            return Ok(0);
        }

        tracing::debug!(
            reader = reader_id,
            counterpart = counterpart_id,
            count = count,
            "Messages marked read"
        );

        if let Some(conn) = self.presence.lookup(counterpart_id) {
            conn.emit(ServerMessage::MessagesRead {
                reader_id: reader_id.to_string(),
                count,
                read_at,
            });
        }

        if let Some(conn) = self.presence.lookup(reader_id) {
            conn.emit(ServerMessage::UnreadCount {
                counterpart: counterpart_id.to_string(),
                count: 0,
            });
        }

        Ok(count)
    }
}
