//! Conversation aggregator.
//!
//! Builds a principal's conversation list on demand. Nothing is cached;
//! every call reads the store.

use std::cmp::Ordering;

use futures::future::try_join_all;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{ConversationSummary, Message};
use crate::store::{MessageStore, DEFAULT_HISTORY_LIMIT};

#[derive(Clone)]
pub struct ConversationAggregator {
    store: MessageStore,
}

impl ConversationAggregator {
    pub fn new(store: MessageStore) -> Self {
        Self { store }
    }

    /// Every counterpart of `principal_id` with its unread count and the
    /// latest message either way, most recent conversation first.
    ///
    /// Per-counterpart lookups run concurrently; the list is returned only
    /// once all of them finish.
    pub async fn list_conversations(&self, principal_id: &str) -> Result<Vec<ConversationSummary>> {
        let principal = principal_id.to_string();
        let counterparts = self
            .store
            .call(move |db| db.counterparts(&principal))
            .await?;

        let lookups = counterparts
            .into_iter()
            .map(|counterpart| self.summarize(principal_id.to_string(), counterpart));
        let mut summaries = try_join_all(lookups).await?;

        summaries.sort_by(|(a_seq, a), (b_seq, b)| {
            let a_last = a.last_message.as_ref().zip(*a_seq);
            let b_last = b.last_message.as_ref().zip(*b_seq);
            by_recency(a_last, b_last).then_with(|| a.counterpart.cmp(&b.counterpart))
        });
        Ok(summaries.into_iter().map(|(_, summary)| summary).collect())
    }

    /// Summary for one counterpart, with the store sequence of its last
    /// message for ordering.
    async fn summarize(
        &self,
        principal: String,
        counterpart: String,
    ) -> Result<(Option<i64>, ConversationSummary)> {
        let unread = {
            let (p, c) = (principal.clone(), counterpart.clone());
            self.store.call(move |db| db.unread_count(&p, &c))
        };
        let last = {
            let (p, c) = (principal, counterpart.clone());
            self.store.call(move |db| db.latest_between(&p, &c))
        };
        let (unread_count, latest) = futures::try_join!(unread, last)?;
        let (seq, last_message) = latest.unzip();

        Ok((
            seq,
            ConversationSummary {
                counterpart,
                unread_count,
                last_message,
            },
        ))
    }

    /// A page of history with one counterpart, oldest first.
    pub async fn history(
        &self,
        principal_id: &str,
        counterpart_id: &str,
        limit: Option<usize>,
        before_id: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let (p, c) = (principal_id.to_string(), counterpart_id.to_string());
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        self.store
            .call(move |db| db.history(&p, &c, limit, before_id))
            .await
    }
}

/// Newest first by `(created_at, seq)`; conversations without a last
/// message sort last.
fn by_recency(a: Option<(&Message, i64)>, b: Option<(&Message, i64)>) -> Ordering {
    match (a, b) {
        (Some((a, a_seq)), Some((b, b_seq))) => (b.created_at, b_seq).cmp(&(a.created_at, a_seq)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
