//! Per-conversation broadcast channels.
//!
//! Streams are created lazily on first subscribe and dropped on the first emit
//! that finds no receivers left.

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::types::MessageUpdate;
use crate::talk::messages::ConversationId;

const BUFFER_SIZE: usize = 100;

pub struct MessageStreamManager {
    streams: DashMap<ConversationId, broadcast::Sender<MessageUpdate>>,
}

impl MessageStreamManager {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<MessageUpdate> {
        self.streams
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(BUFFER_SIZE).0)
            .subscribe()
    }

    pub fn emit(&self, conversation_id: &str, update: MessageUpdate) {
        if let Some(sender) = self.streams.get(conversation_id) {
            if sender.send(update).is_err() && sender.receiver_count() == 0 {
                drop(sender);
                self.streams
                    .remove_if(conversation_id, |_, sender| sender.receiver_count() == 0);
            }
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

impl Default for MessageStreamManager {
    fn default() -> Self {
        Self::new()
    }
}
