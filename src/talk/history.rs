//! History Loader
//!
//! Fetches pages of authoritative messages. Every result is returned oldest
//! first, ready to merge into a [`MessageList`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::message_list::MessageList;
use super::messages::Message;
use crate::store::{MessageQuery, MessageStore, SortOrder, StoreError};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_WINDOW_SIZE: u32 = 50;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Anchor message {0} no longer exists")]
    AnchorNotFound(String),

    #[error("Anchor message {message_id} belongs to conversation {actual}, not {expected}")]
    AnchorOutsideConversation {
        message_id: String,
        expected: String,
        actual: String,
    },

    #[error("Window size must be at least 1")]
    InvalidWindow,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// A chronological page plus whether anything older remains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub has_more_older: bool,
    pub total_pages: u32,
}

/// A bounded slice of history centered on an anchor message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AroundWindow {
    pub anchor: Message,
    pub messages: Vec<Message>,
    pub has_more_before: bool,
    pub has_more_after: bool,
    /// Position of the anchor in `messages`
    pub target_index: usize,
}

#[derive(Clone)]
pub struct HistoryLoader {
    store: Arc<dyn MessageStore>,
    page_size: u32,
}

impl HistoryLoader {
    pub fn new(store: Arc<dyn MessageStore>, page_size: u32) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Newest page of a conversation.
    pub async fn load_latest(&self, conversation_id: &str) -> Result<HistoryPage, HistoryError> {
        self.fetch_backwards(MessageQuery::new(conversation_id, self.page_size))
            .await
    }

    /// The page immediately preceding `before`.
    ///
    /// Repeating a call with the same boundary returns the same page; merging it
    /// into a [`MessageList`] is a no-op the second time.
    pub async fn load_older(
        &self,
        conversation_id: &str,
        before: DateTime<Utc>,
    ) -> Result<HistoryPage, HistoryError> {
        self.fetch_backwards(MessageQuery::new(conversation_id, self.page_size).before(before))
            .await
    }

    async fn fetch_backwards(&self, query: MessageQuery) -> Result<HistoryPage, HistoryError> {
        let page = self.store.list_messages(&query).await?;

        let mut messages = page.items;
        messages.reverse();

        tracing::debug!(
            target: "talk::history::fetch_backwards",
            "Fetched {} messages for conversation {} (total pages: {})",
            messages.len(),
            query.conversation_id,
            page.total_pages
        );

        Ok(HistoryPage {
            has_more_older: !messages.is_empty() && page.total_pages > 1,
            total_pages: page.total_pages,
            messages,
        })
    }

    /// Up to `window_size` messages around `anchor_id`: about half strictly
    /// before the anchor's timestamp and the rest at or after it.
    pub async fn load_around(
        &self,
        anchor_id: &str,
        window_size: u32,
    ) -> Result<AroundWindow, HistoryError> {
        if window_size == 0 {
            return Err(HistoryError::InvalidWindow);
        }

        let anchor = match self.store.get_message(anchor_id).await {
            Ok(anchor) => anchor,
            Err(StoreError::NotFound { .. }) => {
                return Err(HistoryError::AnchorNotFound(anchor_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let before_count = window_size / 2;
        let after_count = window_size - before_count;

        // Page size 0 means "server default" to the store, so ask for one and drop it.
        let before_query = MessageQuery::new(&anchor.conversation_id, before_count.max(1))
            .before(anchor.created_at)
            .sort(SortOrder::NewestFirst);
        let after_query = MessageQuery::new(&anchor.conversation_id, after_count)
            .at_or_after(anchor.created_at)
            .sort(SortOrder::OldestFirst);

        let (before_page, after_page) = tokio::try_join!(
            self.store.list_messages(&before_query),
            self.store.list_messages(&after_query),
        )?;

        let has_more_before = before_page.total_items > u64::from(before_count);
        let has_more_after = after_page.total_items > u64::from(after_count);

        let mut window = MessageList::from_messages(
            before_page
                .items
                .into_iter()
                .take(before_count as usize)
                .chain(after_page.items),
        );
        // Ties on the anchor's timestamp can push it past the after-half.
        window.upsert(anchor.clone());

        let target_index = window
            .iter()
            .position(|m| m.id == anchor.id)
            .unwrap_or_default();

        tracing::debug!(
            target: "talk::history::load_around",
            "Loaded {} messages around {} (more before: {}, more after: {})",
            window.len(),
            anchor.id,
            has_more_before,
            has_more_after
        );

        Ok(AroundWindow {
            anchor,
            messages: window.into(),
            has_more_before,
            has_more_after,
            target_index,
        })
    }
}
