use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::talk::messages::Message;

/// Delivery state of a queued text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Waiting for the next queue pass.
    Pending,
    /// A create call is in flight.
    Sending,
    /// The last attempt failed; retried while below the retry ceiling.
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Sending => "sending",
            PendingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "sending" => Ok(PendingStatus::Sending),
            "failed" => Ok(PendingStatus::Failed),
            other => Err(format!("Unknown pending status: {other}")),
        }
    }
}

/// A text message the user asked to send that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Client-local id, stable for the lifetime of the entry
    pub temp_id: String,

    /// Server id, stamped once the create call returned
    pub real_id: Option<String>,

    pub conversation_id: String,

    pub content: String,

    /// Failed attempts so far
    pub retries: u32,

    pub status: PendingStatus,

    pub created_at: DateTime<Utc>,
}

impl PendingMessage {
    pub(crate) fn new(temp_id: String, conversation_id: String, content: String) -> Self {
        Self {
            temp_id,
            real_id: None,
            conversation_id,
            content,
            retries: 0,
            status: PendingStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Whether an automatic queue pass should attempt this entry.
    pub fn is_retryable(&self, max_retries: u32) -> bool {
        matches!(self.status, PendingStatus::Pending | PendingStatus::Failed)
            && self.retries < max_retries
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Message text is empty")]
    EmptyMessage,

    #[error("No queued message with id {0}")]
    UnknownEntry(String),
}

/// Copy of the whole queue handed to subscribers after each mutation.
pub type QueueSnapshot = Vec<PendingMessage>;

/// Outcome of one `process_queue` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRunReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Server records of the entries delivered in this pass
    pub confirmed: Vec<Message>,
    /// True when the pass did not run at all (offline, empty, or already running).
    pub skipped: bool,
}

impl QueueRunReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            PendingStatus::Pending,
            PendingStatus::Sending,
            PendingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PendingStatus>().unwrap(), status);
        }
        assert!("delivered".parse::<PendingStatus>().is_err());
    }

    #[test]
    fn retryable_respects_status_and_ceiling() {
        let mut msg = PendingMessage::new("t".into(), "chat".into(), "hi".into());
        assert!(msg.is_retryable(3));

        msg.status = PendingStatus::Sending;
        assert!(!msg.is_retryable(3));

        msg.status = PendingStatus::Failed;
        msg.retries = 2;
        assert!(msg.is_retryable(3));

        msg.retries = 3;
        assert!(!msg.is_retryable(3));
    }
}
