//! The authoritative message store.
//!
//! The pipeline talks to the server only through [`MessageStore`]; the
//! PocketBase implementation lives in [`pocketbase`], and tests use the
//! in-memory double from `talk::test_utils`.

pub mod pocketbase;
pub mod realtime;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::talk::messages::{Message, MessageKind};
use crate::talk::uploads::AttachmentFile;

pub use pocketbase::PocketBaseStore;
pub use types::{MessageRecord, RecordEvent};

pub type Result<T> = core::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Realtime subscription closed")]
    SubscriptionClosed,

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

impl StoreError {
    /// Network hiccups and server-side failures; worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Network(_) | StoreError::SubscriptionClosed => true,
            StoreError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub(crate) fn not_found(resource: impl Into<String>) -> Self {
        StoreError::NotFound {
            resource: resource.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Parameters of one page fetch from a conversation's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub conversation_id: String,
    /// 1-based page number
    pub page: u32,
    pub per_page: u32,
    /// Only messages created strictly before this instant
    pub before: Option<DateTime<Utc>>,
    /// Only messages created at or after this instant
    pub at_or_after: Option<DateTime<Utc>>,
    pub sort: SortOrder,
}

impl MessageQuery {
    pub fn new(conversation_id: impl Into<String>, per_page: u32) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            page: 1,
            per_page,
            before: None,
            at_or_after: None,
            sort: SortOrder::NewestFirst,
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page.max(1);
        self
    }

    pub fn before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.before = Some(timestamp);
        self
    }

    pub fn at_or_after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.at_or_after = Some(timestamp);
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Whether `message` falls inside the query's conversation and time bounds.
    pub fn matches(&self, message: &Message) -> bool {
        message.conversation_id == self.conversation_id
            && self.before.is_none_or(|before| message.created_at < before)
            && self.at_or_after.is_none_or(|after| message.created_at >= after)
    }
}

/// One page of results in the order the query asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub total_pages: u32,
}

impl MessagePage {
    pub fn empty(query: &MessageQuery) -> Self {
        Self {
            items: Vec::new(),
            page: query.page,
            per_page: query.per_page,
            total_items: 0,
            total_pages: 0,
        }
    }
}

/// A live stream of change notifications for one conversation.
///
/// Dropping it unsubscribes.
pub struct StoreSubscription {
    events: mpsc::Receiver<RecordEvent>,
    task: Option<JoinHandle<()>>,
}

impl StoreSubscription {
    /// Wraps a channel whose sender is fed by `task`; the task is aborted on drop.
    pub fn new(events: mpsc::Receiver<RecordEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    /// Next event, or `None` once the stream has ended for good.
    pub async fn recv(&mut self) -> Option<RecordEvent> {
        self.events.recv().await
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubscription")
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, conversation_id: &str, content: &str) -> Result<Message>;

    async fn create_message_with_attachment(
        &self,
        conversation_id: &str,
        kind: MessageKind,
        file: &AttachmentFile,
        caption: Option<&str>,
    ) -> Result<Message>;

    async fn list_messages(&self, query: &MessageQuery) -> Result<MessagePage>;

    /// Fetches one message with its sender expanded. Missing ids yield [`StoreError::NotFound`].
    async fn get_message(&self, message_id: &str) -> Result<Message>;

    async fn subscribe(&self, conversation_id: &str) -> Result<StoreSubscription>;

    /// Content search, newest first.
    async fn search(&self, conversation_id: &str, query: &str, per_page: u32)
    -> Result<MessagePage>;

    async fn health_check(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::talk::test_utils::make_message;
    use chrono::TimeZone;

    #[test]
    fn query_bounds_are_strict_before_and_inclusive_after() {
        let t = Utc.timestamp_millis_opt(2_000).unwrap();
        let before = MessageQuery::new("chat", 50).before(t);
        let after = MessageQuery::new("chat", 50).at_or_after(t);

        let at_t = make_message("a", "chat", 2_000);
        let earlier = make_message("b", "chat", 1_000);

        assert!(!before.matches(&at_t));
        assert!(before.matches(&earlier));
        assert!(after.matches(&at_t));
        assert!(!after.matches(&earlier));
        assert!(!after.matches(&make_message("c", "other", 3_000)));
    }

    #[test]
    fn page_is_never_zero() {
        assert_eq!(MessageQuery::new("chat", 10).page(0).page, 1);
    }

    #[test]
    fn transient_classification() {
        assert!(
            StoreError::Status {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !StoreError::Status {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!StoreError::not_found("message x").is_transient());
        assert!(StoreError::SubscriptionClosed.is_transient());
    }
}
