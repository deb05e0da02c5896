use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;
use crate::talk::messages::MessageKind;

/// A file on local disk selected for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFile {
    /// The original filename
    pub filename: String,
    /// The MIME type of the file (e.g., "image/jpeg", "video/mp4")
    pub mime_type: String,
    /// Where the bytes are read from when the upload starts
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

impl AttachmentFile {
    /// Reads size and sniffs the MIME type from the file's magic bytes.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;

        let sniff_path = path.clone();
        let sniffed = tokio::task::spawn_blocking(move || infer::get_from_path(sniff_path))
            .await
            .map_err(|e| UploadError::Io(std::io::Error::other(e)))??;
        let mime_type = sniffed
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());

        Ok(Self {
            filename,
            mime_type,
            path,
            size: metadata.len(),
        })
    }

    /// Message kind implied by the MIME type.
    pub fn suggested_kind(&self) -> MessageKind {
        match self.mime_type.split('/').next() {
            Some("image") => MessageKind::Image,
            Some("video") => MessageKind::Video,
            Some("audio") => MessageKind::Voice,
            _ => MessageKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Failed,
}

/// One attachment being sent; lives until shortly after the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub temp_id: String,
    pub conversation_id: String,
    pub kind: MessageKind,
    pub file: AttachmentFile,
    /// Caption sent with the file; voice notes carry their duration here
    pub caption: Option<String>,
    /// 0 to 100; synthetic until the transfer completes
    pub progress: u8,
    pub status: UploadStatus,
    /// Last failure, shown next to the retry action
    pub error: Option<String>,
}

/// A file refused before any task was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRejection {
    pub filename: String,
    pub reason: String,
}

/// Result of submitting a batch of files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadBatch {
    /// Temp ids of the tasks that started
    pub started: Vec<String>,
    pub rejected: Vec<UploadRejection>,
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Cannot upload files while offline")]
    Offline,

    #[error("{filename} is {size} bytes, above the {max} byte limit")]
    FileTooLarge { filename: String, size: u64, max: u64 },

    #[error("No upload with id {0}")]
    NotFound(String),

    #[error("Upload {0} has not failed")]
    NotRetryable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
