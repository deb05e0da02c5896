use serde::{Deserialize, Deserializer, Serialize};

use super::StoreError;
use crate::talk::messages::{Message, MessageKind, Reactions, SenderProfile};
use crate::talk::utils::{format_record_datetime, parse_record_datetime};

/// A `messages` record exactly as the record store serializes it.
///
/// Optional relations come back as `""` rather than `null`, so every optional
/// string goes through [`empty_as_none`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,

    #[serde(default)]
    pub chat: String,

    #[serde(default, deserialize_with = "empty_as_none")]
    pub sender: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub content: String,

    #[serde(default, deserialize_with = "empty_as_none")]
    pub file: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub reactions: Reactions,

    #[serde(default, deserialize_with = "null_as_default")]
    pub favs: Vec<String>,

    #[serde(default, deserialize_with = "empty_as_none")]
    pub reply_to: Option<String>,

    #[serde(default, deserialize_with = "empty_as_none")]
    pub forwarded_from: Option<String>,

    #[serde(default)]
    pub created: String,

    #[serde(default)]
    pub updated: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<MessageExpand>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExpand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,

    #[serde(default, deserialize_with = "empty_as_none")]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "empty_as_none")]
    pub avatar: Option<String>,
}

impl From<UserRecord> for SenderProfile {
    fn from(user: UserRecord) -> Self {
        SenderProfile {
            id: user.id,
            name: user.name,
            avatar: user.avatar,
        }
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = StoreError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let kind = if record.kind.is_empty() {
            MessageKind::Text
        } else {
            record
                .kind
                .parse::<MessageKind>()
                .map_err(|e| StoreError::Validation(e.to_string()))?
        };

        let created_at = parse_record_datetime(&record.created).ok_or_else(|| {
            StoreError::Validation(format!(
                "Record {} has an invalid created timestamp: '{}'",
                record.id, record.created
            ))
        })?;
        // Freshly created records may omit `updated`
        let updated_at = parse_record_datetime(&record.updated).unwrap_or(created_at);

        let sender_profile = record
            .expand
            .and_then(|expand| expand.sender)
            .map(SenderProfile::from);

        Ok(Message {
            id: record.id,
            conversation_id: record.chat,
            sender_id: record.sender,
            kind,
            content: record.content,
            attachment: record.file,
            reactions: record.reactions,
            favs: record.favs,
            reply_to: record.reply_to,
            forwarded_from: record.forwarded_from,
            sender_profile,
            created_at,
            updated_at,
        })
    }
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        MessageRecord {
            id: message.id.clone(),
            chat: message.conversation_id.clone(),
            sender: message.sender_id.clone(),
            kind: message.kind.as_str().to_string(),
            content: message.content.clone(),
            file: message.attachment.clone(),
            reactions: message.reactions.clone(),
            favs: message.favs.clone(),
            reply_to: message.reply_to.clone(),
            forwarded_from: message.forwarded_from.clone(),
            created: format_record_datetime(&message.created_at),
            updated: format_record_datetime(&message.updated_at),
            expand: message.sender_profile.as_ref().map(|profile| MessageExpand {
                sender: Some(UserRecord {
                    id: profile.id.clone(),
                    name: profile.name.clone(),
                    avatar: profile.avatar.clone(),
                }),
            }),
        }
    }
}

/// Paginated list response of the records API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordList<T> {
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub total_pages: u32,
    pub items: Vec<T>,
}

/// One change notification as pushed by the realtime stream.
///
/// The record stays untyped here; the reconciler narrows it before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub action: String,
    pub record: serde_json::Value,
}

impl RecordEvent {
    pub fn new(action: &str, message: &Message) -> Self {
        Self {
            action: action.to_string(),
            record: serde_json::to_value(MessageRecord::from(message))
                .unwrap_or(serde_json::Value::Null),
        }
    }

    /// Conversation the record belongs to, if the payload carries one.
    pub fn conversation_id(&self) -> Option<&str> {
        self.record.get("chat").and_then(|v| v.as_str())
    }
}

/// Error body returned by the records API on non-2xx responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
