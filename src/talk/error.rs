use thiserror::Error;

use crate::store::StoreError;
use crate::talk::database::DatabaseError;
use crate::talk::history::HistoryError;
use crate::talk::outbound_queue::QueueError;
use crate::talk::uploads::UploadError;

pub type Result<T> = core::result::Result<T, TalkError>;

#[derive(Error, Debug)]
pub enum TalkError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl TalkError {
    /// Whether retrying the same action later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TalkError::Store(e) => e.is_transient(),
            TalkError::History(HistoryError::Store(e)) => e.is_transient(),
            TalkError::Upload(UploadError::Offline) => true,
            TalkError::Upload(UploadError::Store(e)) => e.is_transient(),
            _ => false,
        }
    }
}
