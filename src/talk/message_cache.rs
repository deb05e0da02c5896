//! Persistent Cache
//!
//! A read-through accelerator over the `cached_messages` table. Every failure
//! is logged and swallowed: callers see an empty cache, never an error.

use std::sync::Arc;

use super::database::{CachedMessage, Database};
use super::messages::Message;

#[derive(Clone, Debug, Default)]
pub struct MessageCache {
    database: Option<Arc<Database>>,
}

impl MessageCache {
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database: Some(database),
        }
    }

    /// A cache that stores nothing, used when the database could not be opened.
    pub fn disabled() -> Self {
        Self { database: None }
    }

    pub fn is_available(&self) -> bool {
        self.database.is_some()
    }

    /// Provisional snapshot of a conversation, oldest first. Empty when unavailable.
    pub async fn get_messages(&self, conversation_id: &str) -> Vec<Message> {
        let Some(database) = &self.database else {
            return Vec::new();
        };
        match CachedMessage::find_by_conversation(conversation_id, database).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(
                    target: "talk::message_cache::get_messages",
                    "Failed to read cache for conversation {}: {}",
                    conversation_id,
                    e
                );
                Vec::new()
            }
        }
    }

    /// Makes the conversation's cache mirror `messages` exactly.
    pub async fn save_messages(&self, conversation_id: &str, messages: &[Message]) {
        let Some(database) = &self.database else {
            return;
        };
        if let Err(e) =
            CachedMessage::replace_for_conversation(conversation_id, messages, database).await
        {
            tracing::warn!(
                target: "talk::message_cache::save_messages",
                "Failed to save {} messages for conversation {}: {}",
                messages.len(),
                conversation_id,
                e
            );
        }
    }

    pub async fn add_message(&self, message: &Message) {
        let Some(database) = &self.database else {
            return;
        };
        if let Err(e) = CachedMessage::upsert(message, database).await {
            tracing::warn!(
                target: "talk::message_cache::add_message",
                "Failed to cache message {}: {}",
                message.id,
                e
            );
        }
    }

    pub async fn remove_message(&self, message_id: &str) {
        let Some(database) = &self.database else {
            return;
        };
        if let Err(e) = CachedMessage::delete_by_id(message_id, database).await {
            tracing::warn!(
                target: "talk::message_cache::remove_message",
                "Failed to evict message {}: {}",
                message_id,
                e
            );
        }
    }

    pub async fn clear_chat(&self, conversation_id: &str) {
        let Some(database) = &self.database else {
            return;
        };
        if let Err(e) = CachedMessage::delete_by_conversation(conversation_id, database).await {
            tracing::warn!(
                target: "talk::message_cache::clear_chat",
                "Failed to clear cache for conversation {}: {}",
                conversation_id,
                e
            );
        }
    }

    pub async fn clear(&self) {
        let Some(database) = &self.database else {
            return;
        };
        if let Err(e) = CachedMessage::delete_all(database).await {
            tracing::warn!(target: "talk::message_cache::clear", "Failed to clear cache: {}", e);
        }
    }
}
