//! Upload Pipeline
//!
//! Attachment sends run independently of the text queue: they are refused
//! while offline, each file gets its own task with synthetic progress, and a
//! failed task waits for an explicit retry.

mod types;

pub use types::{
    AttachmentFile, UploadBatch, UploadError, UploadRejection, UploadStatus, UploadTask,
};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::connectivity::ConnectionMonitor;
use super::messages::MessageKind;
use super::utils::generate_temp_id;
use crate::store::MessageStore;

/// Tunables of the upload lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub max_file_size: u64,
    pub progress_tick: Duration,
    pub progress_step: u8,
    pub progress_ceiling: u8,
    /// How long a finished task stays visible at 100%
    pub completion_linger: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            progress_tick: Duration::from_millis(100),
            progress_step: 10,
            progress_ceiling: 90,
            completion_linger: Duration::from_millis(500),
        }
    }
}

struct Inner {
    conversation_id: String,
    store: Arc<dyn MessageStore>,
    connectivity: ConnectionMonitor,
    settings: UploadSettings,
    tasks: Mutex<Vec<UploadTask>>,
    transfers: DashMap<String, AbortHandle>,
    updates: watch::Sender<Vec<UploadTask>>,
}

/// Upload state for one conversation. Clones share the same task list.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    pub fn new(
        conversation_id: &str,
        store: Arc<dyn MessageStore>,
        connectivity: ConnectionMonitor,
        settings: UploadSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conversation_id: conversation_id.to_string(),
                store,
                connectivity,
                settings,
                tasks: Mutex::new(Vec::new()),
                transfers: DashMap::new(),
                updates: watch::channel(Vec::new()).0,
            }),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    /// Current tasks in submission order.
    pub fn tasks(&self) -> Vec<UploadTask> {
        self.inner.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<UploadTask>> {
        self.inner.updates.subscribe()
    }

    /// Starts one task per acceptable file.
    ///
    /// Offline rejects the whole batch. Oversized files are reported in
    /// [`UploadBatch::rejected`] and never get a task or a network call.
    pub fn upload_files(
        &self,
        files: Vec<AttachmentFile>,
        kind: MessageKind,
        caption: Option<String>,
    ) -> Result<UploadBatch, UploadError> {
        if !self.inner.connectivity.is_online() {
            return Err(UploadError::Offline);
        }

        let max = self.inner.settings.max_file_size;
        let mut batch = UploadBatch::default();

        for file in files {
            if file.size > max {
                let error = UploadError::FileTooLarge {
                    filename: file.filename.clone(),
                    size: file.size,
                    max,
                };
                tracing::warn!(target: "talk::uploads::upload_files", "{}", error);
                batch.rejected.push(UploadRejection {
                    filename: file.filename,
                    reason: error.to_string(),
                });
                continue;
            }

            let task = UploadTask {
                temp_id: generate_temp_id(),
                conversation_id: self.inner.conversation_id.clone(),
                kind,
                file,
                caption: caption.clone(),
                progress: 0,
                status: UploadStatus::Uploading,
                error: None,
            };
            let temp_id = task.temp_id.clone();

            let mut tasks = self.inner.lock();
            tasks.push(task.clone());
            self.inner.start_transfer(&tasks, task);
            batch.started.push(temp_id);
        }

        Ok(batch)
    }

    /// Aborts the transfer and forgets the task. Returns false for unknown ids.
    pub fn cancel_upload(&self, temp_id: &str) -> bool {
        let mut tasks = self.inner.lock();
        if let Some((_, handle)) = self.inner.transfers.remove(temp_id) {
            handle.abort();
        }
        let before = tasks.len();
        tasks.retain(|t| t.temp_id != temp_id);
        let removed = tasks.len() != before;
        if removed {
            self.inner.publish(&tasks);
            tracing::debug!(target: "talk::uploads::cancel_upload", "Cancelled upload {}", temp_id);
        }
        removed
    }

    /// Re-attempts a failed task from 0%. Manual retries are unbounded.
    pub fn retry_upload(&self, temp_id: &str) -> Result<(), UploadError> {
        if !self.inner.connectivity.is_online() {
            return Err(UploadError::Offline);
        }

        let mut tasks = self.inner.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.temp_id == temp_id)
            .ok_or_else(|| UploadError::NotFound(temp_id.to_string()))?;
        if task.status != UploadStatus::Failed {
            return Err(UploadError::NotRetryable(temp_id.to_string()));
        }

        task.status = UploadStatus::Uploading;
        task.progress = 0;
        task.error = None;
        let task = task.clone();
        self.inner.start_transfer(&tasks, task);
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Vec<UploadTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, tasks: &[UploadTask]) {
        self.updates.send_replace(tasks.to_vec());
    }

    /// Spawns the transfer. Called with the task list locked so the handle is
    /// registered before the transfer can finish and clean up after itself.
    fn start_transfer(self: &Arc<Self>, tasks: &[UploadTask], task: UploadTask) {
        self.publish(tasks);
        let temp_id = task.temp_id.clone();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_transfer(task).await });
        self.transfers.insert(temp_id, handle.abort_handle());
    }

    async fn run_transfer(self: Arc<Self>, task: UploadTask) {
        let upload = self.store.create_message_with_attachment(
            &task.conversation_id,
            task.kind,
            &task.file,
            task.caption.as_deref(),
        );
        tokio::pin!(upload);

        let mut ticker = tokio::time::interval(self.settings.progress_tick);
        // The first tick completes immediately
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut upload => break result,
                _ = ticker.tick() => self.bump_progress(&task.temp_id),
            }
        };

        match result {
            Ok(message) => {
                tracing::debug!(
                    target: "talk::uploads::run_transfer",
                    "Upload {} stored as message {}",
                    task.temp_id,
                    message.id
                );
                self.update(&task.temp_id, |t| t.progress = 100);
                tokio::time::sleep(self.settings.completion_linger).await;

                let mut tasks = self.lock();
                self.transfers.remove(&task.temp_id);
                let before = tasks.len();
                tasks.retain(|t| t.temp_id != task.temp_id);
                if tasks.len() != before {
                    self.publish(&tasks);
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "talk::uploads::run_transfer",
                    "Upload {} ({}) failed: {}",
                    task.temp_id,
                    task.file.filename,
                    e
                );
                let error = e.to_string();
                let mut tasks = self.lock();
                self.transfers.remove(&task.temp_id);
                if let Some(t) = tasks.iter_mut().find(|t| t.temp_id == task.temp_id) {
                    t.status = UploadStatus::Failed;
                    t.error = Some(error);
                    self.publish(&tasks);
                }
            }
        }
    }

    fn bump_progress(&self, temp_id: &str) {
        let step = self.settings.progress_step;
        let ceiling = self.settings.progress_ceiling;
        self.update(temp_id, |t| {
            t.progress = t.progress.saturating_add(step).min(ceiling);
        });
    }

    fn update(&self, temp_id: &str, change: impl FnOnce(&mut UploadTask)) {
        let mut tasks = self.lock();
        if let Some(task) = tasks.iter_mut().find(|t| t.temp_id == temp_id) {
            change(task);
            self.publish(&tasks);
        }
    }
}
