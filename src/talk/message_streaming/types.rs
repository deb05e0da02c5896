//! Types for the message streaming feature.
//!
//! Realtime payloads arrive untyped from the store; [`RealtimeEvent`] is the
//! closed form the reconciler works with. [`MessageUpdate`] is what goes out
//! to subscribers once a change has been applied.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::store::types::{MessageRecord, RecordEvent};
use crate::store::StoreError;
use crate::talk::messages::{Message, MessageId};

/// What triggered a message update.
///
/// The accompanying `message` field in [`MessageUpdate`] always contains
/// the most complete state known for the affected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTrigger {
    /// A new message arrived through the realtime stream.
    NewMessage,

    /// An existing message was edited or its reactions changed.
    MessageUpdated,

    /// The message was deleted; `message` is the last known copy.
    MessageDeleted,

    /// This device's own send was confirmed by the server.
    MessageSent,
}

/// Represents a single update to be sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub trigger: UpdateTrigger,
    pub message: Message,
}

impl MessageUpdate {
    pub fn new(trigger: UpdateTrigger, message: Message) -> Self {
        Self { trigger, message }
    }
}

/// Result of subscribing to a conversation's updates.
pub struct ConversationMessageSubscription {
    /// Cached messages at subscription time, oldest first.
    pub initial_messages: Vec<Message>,

    /// Receiver for updates after the initial snapshot.
    pub updates: broadcast::Receiver<MessageUpdate>,
}

/// Lifecycle of a conversation's realtime feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Active,
}

/// A validated change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    Created(Message),
    Updated(Message),
    Deleted {
        id: MessageId,
        conversation_id: String,
    },
}

impl RealtimeEvent {
    pub fn message_id(&self) -> &str {
        match self {
            RealtimeEvent::Created(message) | RealtimeEvent::Updated(message) => &message.id,
            RealtimeEvent::Deleted { id, .. } => id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            RealtimeEvent::Created(message) | RealtimeEvent::Updated(message) => {
                &message.conversation_id
            }
            RealtimeEvent::Deleted {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

#[derive(Error, Debug)]
pub enum InvalidRealtimeEvent {
    #[error("Unknown realtime action: {0}")]
    UnknownAction(String),

    #[error("Realtime record is missing field {0}")]
    MissingField(&'static str),

    #[error("Malformed realtime record: {0}")]
    Record(#[from] StoreError),

    #[error("Malformed realtime payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl TryFrom<RecordEvent> for RealtimeEvent {
    type Error = InvalidRealtimeEvent;

    fn try_from(event: RecordEvent) -> Result<Self, Self::Error> {
        match event.action.as_str() {
            "create" | "update" => {
                let record: MessageRecord = serde_json::from_value(event.record)?;
                let message = Message::try_from(record)?;
                Ok(if event.action == "create" {
                    RealtimeEvent::Created(message)
                } else {
                    RealtimeEvent::Updated(message)
                })
            }
            // Deletions only need the identifiers; the rest of the record may be stale.
            "delete" => {
                let field = |name: &'static str| {
                    event
                        .record
                        .get(name)
                        .and_then(|v| v.as_str())
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                        .ok_or(InvalidRealtimeEvent::MissingField(name))
                };
                Ok(RealtimeEvent::Deleted {
                    id: field("id")?,
                    conversation_id: field("chat")?,
                })
            }
            other => Err(InvalidRealtimeEvent::UnknownAction(other.to_string())),
        }
    }
}
