//! # Message Store
//!
//! Durable, append-only log of direct messages with mutable delivery/read
//! flags, backed by SQLite.
//!
//! ```text
//! ┌──────────────────┐   call(|db| ...)   ┌──────────────────────┐
//! │  async callers   │ ─────────────────► │  spawn_blocking      │
//! │ (router, engine) │                    │  Mutex<Connection>   │
//! └──────────────────┘                    └──────────┬───────────┘
//!                                                    ▼
//!                                         ┌──────────────────────┐
//!                                         │ messages (seq, id,   │
//!                                         │  sender, receiver,   │
//!                                         │  delivered, read...) │
//!                                         └──────────────────────┘
//! ```
//!
//! State transitions are single conditional `UPDATE` statements, never
//! read-then-write, so concurrent read receipts cannot double-count. The
//! delivered/read invariants are also pinned down by `CHECK` constraints.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::Message;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    sender_id TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    content TEXT NOT NULL,
    -- Unix milliseconds
    created_at INTEGER NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    delivered_at INTEGER,
    read INTEGER NOT NULL DEFAULT 0,
    read_at INTEGER,
    CHECK (sender_id <> receiver_id),
    CHECK ((delivered = 0 AND delivered_at IS NULL) OR (delivered = 1 AND delivered_at IS NOT NULL)),
    CHECK ((read = 0 AND read_at IS NULL) OR (read = 1 AND read_at IS NOT NULL)),
    CHECK (read = 0 OR delivered = 1)
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_unread ON messages(sender_id, receiver_id, read);
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
"#;

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, content, created_at, delivered, delivered_at, read, read_at";

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Hard cap on a single history page.
pub const MAX_HISTORY_LIMIT: usize = 500;

/// Handle to the message log. Cheap to clone.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// Open or create the store.
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;

        tracing::info!(
            path = path.unwrap_or(":memory:"),
            "Message store opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run blocking store work off the async executor.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MessageStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Append a newly admitted message.
    pub fn insert(&self, message: &Message) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (id, sender_id, receiver_id, content, created_at,
                                   delivered, delivered_at, read, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.sender_id,
                message.receiver_id,
                message.content,
                message.created_at.timestamp_millis(),
                message.delivered,
                message.delivered_at.map(|t| t.timestamp_millis()),
                message.read,
                message.read_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// Transition every unread message `sender → receiver` to read.
    ///
    /// Conditions only on `read = 0`. A message that was never delivered is
    /// marked delivered at the same instant so `read ⟹ delivered` holds.
    /// Returns the number of rows transitioned by this call.
    pub fn mark_read(&self, receiver_id: &str, sender_id: &str, read_at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE messages
             SET read = 1,
                 read_at = ?1,
                 delivered = 1,
                 delivered_at = COALESCE(delivered_at, ?1)
             WHERE sender_id = ?2 AND receiver_id = ?3 AND read = 0",
            params![read_at.timestamp_millis(), sender_id, receiver_id],
        )?;
        Ok(rows)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Get a single message by id.
    pub fn get(&self, id: Uuid) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let message = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id.to_string()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Unread messages from `sender_id` addressed to `receiver_id`.
    pub fn unread_count(&self, receiver_id: &str, sender_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0",
            params![sender_id, receiver_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Every principal that `principal_id` has exchanged a message with,
    /// in either direction, each exactly once.
    pub fn counterparts(&self, principal_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT receiver_id FROM messages WHERE sender_id = ?1
             UNION
             SELECT sender_id FROM messages WHERE receiver_id = ?1",
        )?;
        let rows = stmt.query_map(params![principal_id], |row| row.get::<_, String>(0))?;

        let mut counterparts = Vec::new();
        for row in rows {
            counterparts.push(row?);
        }
        Ok(counterparts)
    }

    /// Most recent message between two principals, in either direction.
    pub fn last_message_between(&self, a: &str, b: &str) -> Result<Option<Message>> {
        Ok(self.latest_between(a, b)?.map(|(_, message)| message))
    }

    /// Like [`last_message_between`](Self::last_message_between), paired with
    /// the message's insertion sequence so callers can break timestamp ties.
    pub fn latest_between(&self, a: &str, b: &str) -> Result<Option<(i64, Message)>> {
        let conn = self.conn.lock();
        let latest = conn
            .query_row(
                &format!(
                    "SELECT {}, seq FROM messages
                     WHERE (sender_id = ?1 AND receiver_id = ?2)
                        OR (sender_id = ?2 AND receiver_id = ?1)
                     ORDER BY created_at DESC, seq DESC
                     LIMIT 1",
                    MESSAGE_COLUMNS
                ),
                params![a, b],
                |row| Ok((row.get(9)?, row_to_message(row)?)),
            )
            .optional()?;
        Ok(latest)
    }

    /// A page of the conversation between two principals, oldest first.
    ///
    /// Returns the newest `limit` messages that precede `before_id` in
    /// `(created_at, seq)` order, or the newest overall when `before_id` is
    /// None. An unknown cursor or a zero limit yields an empty page.
    pub fn history(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        before_id: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = limit.min(MAX_HISTORY_LIMIT);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE ((sender_id = ?1 AND receiver_id = ?2)
                 OR (sender_id = ?2 AND receiver_id = ?1))
               AND (?3 IS NULL
                    OR (created_at, seq) < (SELECT created_at, seq FROM messages WHERE id = ?3))
             ORDER BY created_at DESC, seq DESC
             LIMIT ?4",
            MESSAGE_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![a, b, before_id.map(|id| id.to_string()), limit as i64],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    /// Total number of stored messages.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn millis_to_datetime(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at = millis_to_datetime(4, row.get(4)?)?;
    let delivered_at = match row.get::<_, Option<i64>>(6)? {
        Some(ms) => Some(millis_to_datetime(6, ms)?),
        None => None,
    };
    let read_at = match row.get::<_, Option<i64>>(8)? {
        Some(ms) => Some(millis_to_datetime(8, ms)?),
        None => None,
    };

    Ok(Message {
        id,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        created_at,
        delivered: row.get(5)?,
        delivered_at,
        read: row.get(7)?,
        read_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::now_millis;
    use chrono::Duration;

    fn store() -> MessageStore {
        MessageStore::open(None).unwrap()
    }

    fn message_at(from: &str, to: &str, content: &str, offset_ms: i64) -> Message {
        let mut m = Message::admit(from, to, content, false);
        m.created_at = m.created_at + Duration::milliseconds(offset_ms);
        m
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let store = store();
        let m = Message::admit("alice", "bob", "hello", true);
        store.insert(&m).unwrap();

        let loaded = store.get(m.id).unwrap().unwrap();
        assert_eq!(loaded, m);
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_self_message_rejected_by_schema() {
        let store = store();
        let m = Message::admit("alice", "alice", "me", false);
        assert!(store.insert(&m).is_err());
    }

    #[test]
    fn test_delivered_without_timestamp_rejected_by_schema() {
        let store = store();
        let mut m = Message::admit("alice", "bob", "hi", false);
        m.delivered = true;
        assert!(store.insert(&m).is_err());
    }

    #[test]
    fn test_mark_read_only_touches_matching_pair() {
        let store = store();
        store.insert(&Message::admit("alice", "bob", "1", true)).unwrap();
        store.insert(&Message::admit("alice", "bob", "2", false)).unwrap();
        // Opposite direction and unrelated pairs
        let reverse = Message::admit("bob", "alice", "3", true);
        let unrelated = Message::admit("carol", "bob", "4", true);
        store.insert(&reverse).unwrap();
        store.insert(&unrelated).unwrap();

        let changed = store.mark_read("bob", "alice", now_millis()).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(store.unread_count("bob", "alice").unwrap(), 0);

        assert!(!store.get(reverse.id).unwrap().unwrap().read);
        assert!(!store.get(unrelated.id).unwrap().unwrap().read);
        assert_eq!(store.unread_count("bob", "carol").unwrap(), 1);

        // Second pass has nothing left to do
        assert_eq!(store.mark_read("bob", "alice", now_millis()).unwrap(), 0);
    }

    #[test]
    fn test_mark_read_implies_delivered() {
        let store = store();
        let m = Message::admit("alice", "bob", "offline", false);
        store.insert(&m).unwrap();

        let read_at = now_millis();
        store.mark_read("bob", "alice", read_at).unwrap();

        let loaded = store.get(m.id).unwrap().unwrap();
        assert!(loaded.read);
        assert_eq!(loaded.read_at, Some(read_at));
        assert!(loaded.delivered);
        assert_eq!(loaded.delivered_at, Some(read_at));
    }

    #[test]
    fn test_mark_read_keeps_original_delivery_time() {
        let store = store();
        let m = Message::admit("alice", "bob", "online", true);
        store.insert(&m).unwrap();

        store
            .mark_read("bob", "alice", m.created_at + Duration::seconds(5))
            .unwrap();

        let loaded = store.get(m.id).unwrap().unwrap();
        assert_eq!(loaded.delivered_at, m.delivered_at);
    }

    #[test]
    fn test_counterparts_distinct_both_directions() {
        let store = store();
        store.insert(&Message::admit("alice", "bob", "a", false)).unwrap();
        store.insert(&Message::admit("bob", "alice", "b", false)).unwrap();
        store.insert(&Message::admit("carol", "alice", "c", false)).unwrap();
        store.insert(&Message::admit("bob", "carol", "d", false)).unwrap();

        let mut counterparts = store.counterparts("alice").unwrap();
        counterparts.sort();
        assert_eq!(counterparts, vec!["bob".to_string(), "carol".to_string()]);
        assert!(store.counterparts("dave").unwrap().is_empty());
    }

    #[test]
    fn test_last_message_between_either_direction() {
        let store = store();
        store.insert(&message_at("alice", "bob", "first", 0)).unwrap();
        store.insert(&message_at("bob", "alice", "second", 10)).unwrap();
        store.insert(&message_at("alice", "carol", "other", 20)).unwrap();

        let last = store.last_message_between("alice", "bob").unwrap().unwrap();
        assert_eq!(last.content, "second");
        let same = store.last_message_between("bob", "alice").unwrap().unwrap();
        assert_eq!(same.id, last.id);
        assert!(store.last_message_between("bob", "carol").unwrap().is_none());
    }

    #[test]
    fn test_last_message_ties_broken_by_insertion_order() {
        let store = store();
        let first = Message::admit("alice", "bob", "first", false);
        let mut second = Message::admit("bob", "alice", "second", false);
        second.created_at = first.created_at;
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        let last = store.last_message_between("alice", "bob").unwrap().unwrap();
        assert_eq!(last.content, "second");
    }

    #[test]
    fn test_history_pages_chronologically() {
        let store = store();
        for i in 0..5 {
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            store
                .insert(&message_at(from, to, &format!("msg-{}", i), i * 10))
                .unwrap();
        }
        store.insert(&message_at("alice", "carol", "noise", 100)).unwrap();

        let page = store.history("alice", "bob", 3, None).unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-2", "msg-3", "msg-4"]);

        let older = store.history("alice", "bob", 3, Some(page[0].id)).unwrap();
        let contents: Vec<_> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-0", "msg-1"]);
    }

    #[test]
    fn test_history_pages_through_equal_timestamps() {
        let store = store();
        let created_at = now_millis();
        for i in 0..5 {
            let mut m = Message::admit("alice", "bob", &format!("m{}", i), false);
            m.created_at = created_at;
            store.insert(&m).unwrap();
        }

        let page = store.history("alice", "bob", 3, None).unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        let older = store.history("alice", "bob", 3, Some(page[0].id)).unwrap();
        let contents: Vec<_> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1"]);

        assert!(store.history("alice", "bob", 3, Some(older[0].id)).unwrap().is_empty());
    }

    #[test]
    fn test_history_zero_limit_and_unknown_cursor_are_empty() {
        let store = store();
        store.insert(&message_at("alice", "bob", "hello", 0)).unwrap();

        assert!(store.history("alice", "bob", 0, None).unwrap().is_empty());
        assert!(store
            .history("alice", "bob", 10, Some(Uuid::new_v4()))
            .unwrap()
            .is_empty());
        assert_eq!(store.history("alice", "bob", 10, None).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_between_reports_sequence() {
        let store = store();
        let first = Message::admit("alice", "bob", "first", false);
        let mut second = Message::admit("alice", "carol", "second", false);
        second.created_at = first.created_at;
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        let (bob_seq, _) = store.latest_between("alice", "bob").unwrap().unwrap();
        let (carol_seq, last) = store.latest_between("alice", "carol").unwrap().unwrap();
        assert!(carol_seq > bob_seq);
        assert_eq!(last.content, "second");
    }

    #[tokio::test]
    async fn test_call_runs_off_executor() {
        let store = store();
        let m = Message::admit("alice", "bob", "async", false);
        let id = m.id;
        store.call(move |db| db.insert(&m)).await.unwrap();

        let loaded = store.call(move |db| db.get(id)).await.unwrap();
        assert!(loaded.is_some());
    }
}
