use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a message record on the server.
pub type MessageId = String;

/// Identifier of a conversation (a chat thread).
pub type ConversationId = String;

/// Emoji to the set of user ids who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<String>>;

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Video,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Video => "video",
            MessageKind::Voice => "voice",
        }
    }

    pub fn is_attachment(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "video" => Ok(MessageKind::Video),
            "voice" => Ok(MessageKind::Voice),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown message type: {0}")]
pub struct UnknownMessageKind(pub String);

/// Resolved identity of a message sender, present on expanded records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub id: String,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

/// A read-only projection of an authoritative, server-owned message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned record id
    pub id: MessageId,

    /// Conversation the message belongs to
    pub conversation_id: ConversationId,

    /// Author of the message; `None` for system messages or deleted users
    pub sender_id: Option<String>,

    pub kind: MessageKind,

    /// Text content, or the caption of an attachment
    pub content: String,

    /// Stored attachment filename on the server
    pub attachment: Option<String>,

    #[serde(default)]
    pub reactions: Reactions,

    /// Users who marked this message as a favourite
    #[serde(default)]
    pub favs: Vec<String>,

    pub reply_to: Option<MessageId>,

    pub forwarded_from: Option<MessageId>,

    /// Present when the record was fetched with the sender expanded
    pub sender_profile: Option<SenderProfile>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Key the merged display list is ordered by.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    /// Whether the sender identity has been resolved.
    pub fn is_expanded(&self) -> bool {
        self.sender_id.is_none() || self.sender_profile.is_some()
    }

    /// Last-write-wins: true when `other` is at least as recent as `self`.
    pub fn is_superseded_by(&self, other: &Message) -> bool {
        other.updated_at >= self.updated_at
    }
}
