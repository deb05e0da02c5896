use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod connectivity;
pub mod conversation;
pub mod database;
pub mod error;
pub mod history;
pub mod message_cache;
pub mod message_list;
pub mod message_streaming;
pub mod messages;
pub mod outbound_queue;
pub mod scheduled_tasks;
pub mod uploads;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

use crate::init_tracing;
use crate::store::MessageStore;

use connectivity::ConnectionMonitor;
use conversation::ConversationController;
use database::Database;
use error::{Result, TalkError};
use history::{DEFAULT_PAGE_SIZE, DEFAULT_WINDOW_SIZE, HistoryLoader};
use message_cache::MessageCache;
use message_streaming::{
    ConversationMessageSubscription, MessageStreamManager, MessageUpdate, UpdateTrigger,
};
use messages::Message;
use outbound_queue::{DEFAULT_MAX_RETRIES, OutboundQueue, QueueError, QueueRunReport};
use scheduled_tasks::{ConnectivityProbe, OutboundQueueFlush, Scheduler, SchedulerConfig, Task};
use uploads::{UploadManager, UploadSettings};

/// Tunables of the sync and delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Messages per history page
    pub page_size: u32,
    /// Messages fetched around an anchor
    pub around_window: u32,
    /// Automatic send attempts before a queued message needs a manual retry
    pub max_send_retries: u32,
    pub uploads: UploadSettings,
    pub probe_interval: Duration,
    pub queue_flush_interval: Duration,
    pub search_page_size: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            around_window: DEFAULT_WINDOW_SIZE,
            max_send_retries: DEFAULT_MAX_RETRIES,
            uploads: UploadSettings::default(),
            probe_interval: Duration::from_secs(10),
            queue_flush_interval: Duration::from_secs(30),
            search_page_size: 50,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TalkConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Base URL of the record store
    pub server_url: String,

    pub pipeline: PipelineConfig,

    pub scheduler: SchedulerConfig,
}

impl TalkConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path, server_url: &str) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            server_url: server_url.trim_end_matches('/').to_string(),
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Reads `TALK_DATA_DIR`, `TALK_LOGS_DIR` and `TALK_SERVER_URL`, loading a `.env` file first if present.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine; the variables may come from the environment.
        let _ = dotenvy::dotenv();

        let server_url = std::env::var("TALK_SERVER_URL")
            .map_err(|_| TalkError::Configuration("TALK_SERVER_URL is not set".to_string()))?;
        let data_dir = std::env::var("TALK_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let logs_dir = std::env::var("TALK_LOGS_DIR").unwrap_or_else(|_| "./logs".to_string());

        Ok(Self::new(
            Path::new(&data_dir),
            Path::new(&logs_dir),
            &server_url,
        ))
    }
}

/// The shared components every conversation view and background task works with.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) history: HistoryLoader,
    pub(crate) cache: MessageCache,
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) connectivity: ConnectionMonitor,
    pub(crate) streams: Arc<MessageStreamManager>,
}

impl Pipeline {
    pub(crate) fn new(
        config: PipelineConfig,
        store: Arc<dyn MessageStore>,
        cache: MessageCache,
        queue: Arc<OutboundQueue>,
        connectivity: ConnectionMonitor,
    ) -> Self {
        Self {
            history: HistoryLoader::new(store.clone(), config.page_size),
            config,
            store,
            cache,
            queue,
            connectivity,
            streams: Arc::new(MessageStreamManager::new()),
        }
    }

    /// Runs one queue pass against the store and announces every confirmed send.
    ///
    /// Announcements go out after the pass so that a queue entry is stamped with
    /// its server id before any view can show the confirmed message.
    pub async fn flush_outbound_queue(&self) -> QueueRunReport {
        let store = &self.store;
        let report = self
            .queue
            .process_queue(
                |conversation_id, content| {
                    let store = Arc::clone(store);
                    async move { store.create_message(&conversation_id, &content).await }
                },
                self.connectivity.is_online(),
            )
            .await;

        for message in &report.confirmed {
            self.cache.add_message(message).await;
            self.streams.emit(
                &message.conversation_id,
                MessageUpdate::new(UpdateTrigger::MessageSent, message.clone()),
            );
        }
        report
    }

    /// Queues a text message and flushes right away when online.
    pub async fn send_message(&self, conversation_id: &str, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(QueueError::EmptyMessage.into());
        }

        let temp_id = self.queue.add(conversation_id, text);
        if self.connectivity.is_online() {
            self.flush_outbound_queue().await;
        }
        Ok(temp_id)
    }
}

struct Background {
    scheduler: Scheduler,
    reconnect: JoinHandle<()>,
}

/// Entry point for the host application.
pub struct Talk {
    pub config: TalkConfig,
    pipeline: Pipeline,
    database: Option<Arc<Database>>,
    upload_managers: DashMap<String, UploadManager>,
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for Talk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Talk")
            .field("config", &self.config)
            .field("database", &self.database.as_ref().map(|db| &db.path))
            .field("queued", &self.pipeline.queue.len())
            .field("online", &self.pipeline.connectivity.is_online())
            .finish()
    }
}

impl Talk {
    /// Sets up directories, logging and local storage, restores the outbound
    /// queue and starts the background tasks.
    ///
    /// A database that cannot be opened is not fatal: the pipeline runs with no
    /// cache and an in-memory queue.
    pub async fn initialize(config: TalkConfig, store: Arc<dyn MessageStore>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.logs_dir)?;

        init_tracing(&config.logs_dir);
        tracing::debug!(
            target: "talk::initialize",
            "Logging initialized in directory: {:?}",
            config.logs_dir
        );

        let database = match Database::new(config.data_dir.join("talk.sqlite")).await {
            Ok(database) => Some(Arc::new(database)),
            Err(e) => {
                tracing::warn!(
                    target: "talk::initialize",
                    "Local database unavailable, running without cache: {}",
                    e
                );
                None
            }
        };

        let max_retries = config.pipeline.max_send_retries;
        let (cache, queue) = match &database {
            Some(database) => (
                MessageCache::new(database.clone()),
                OutboundQueue::restore(database.clone(), max_retries).await,
            ),
            None => (
                MessageCache::disabled(),
                Arc::new(OutboundQueue::new(max_retries)),
            ),
        };

        let pipeline = Pipeline::new(
            config.pipeline.clone(),
            store,
            cache,
            queue,
            ConnectionMonitor::default(),
        );

        let tasks: Vec<Arc<dyn Task>> = vec![
            Arc::new(ConnectivityProbe::new(config.pipeline.probe_interval)),
            Arc::new(OutboundQueueFlush::new(config.pipeline.queue_flush_interval)),
        ];
        let scheduler = Scheduler::start(&config.scheduler, pipeline.clone(), tasks);
        let online = pipeline.connectivity.subscribe();
        let reconnect = tokio::spawn(flush_on_reconnect(pipeline.clone(), online));

        tracing::info!(
            target: "talk::initialize",
            "Talk initialized with {} queued messages and {} scheduled tasks",
            pipeline.queue.len(),
            scheduler.task_count()
        );

        Ok(Arc::new(Self {
            config,
            pipeline,
            database,
            upload_managers: DashMap::new(),
            background: Mutex::new(Some(Background {
                scheduler,
                reconnect,
            })),
        }))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn outbound_queue(&self) -> &Arc<OutboundQueue> {
        &self.pipeline.queue
    }

    pub fn cache(&self) -> &MessageCache {
        &self.pipeline.cache
    }

    pub fn history(&self) -> &HistoryLoader {
        &self.pipeline.history
    }

    pub fn connectivity(&self) -> &ConnectionMonitor {
        &self.pipeline.connectivity
    }

    /// Opens a live view of a conversation, optionally centered on `anchor`.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        anchor: Option<&str>,
    ) -> Result<ConversationController> {
        ConversationController::open(self.pipeline.clone(), conversation_id, anchor).await
    }

    pub async fn send_message(&self, conversation_id: &str, text: &str) -> Result<String> {
        self.pipeline.send_message(conversation_id, text).await
    }

    pub async fn flush_outbound_queue(&self) -> QueueRunReport {
        self.pipeline.flush_outbound_queue().await
    }

    /// Manual resend of a queued message, including one past the retry ceiling.
    pub async fn retry_message(&self, temp_id: &str) -> Result<()> {
        if !self.pipeline.queue.retry(temp_id) {
            return Err(QueueError::UnknownEntry(temp_id.to_string()).into());
        }
        if self.pipeline.connectivity.is_online() {
            self.pipeline.flush_outbound_queue().await;
        }
        Ok(())
    }

    /// The upload state of a conversation; repeated calls share one task list.
    pub fn upload_manager(&self, conversation_id: &str) -> UploadManager {
        self.upload_managers
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                UploadManager::new(
                    conversation_id,
                    self.pipeline.store.clone(),
                    self.pipeline.connectivity.clone(),
                    self.pipeline.config.uploads.clone(),
                )
            })
            .clone()
    }

    /// Server-side content search, newest first.
    pub async fn search_messages(&self, conversation_id: &str, query: &str) -> Result<Vec<Message>> {
        let page = self
            .pipeline
            .store
            .search(conversation_id, query, self.pipeline.config.search_page_size)
            .await?;
        Ok(page.items)
    }

    /// Drops queued sends, cached messages and upload state of a conversation.
    pub async fn clear_conversation(&self, conversation_id: &str) {
        self.pipeline.queue.clear_chat(conversation_id);
        self.pipeline.cache.clear_chat(conversation_id).await;
        if let Some((_, manager)) = self.upload_managers.remove(conversation_id) {
            for task in manager.tasks() {
                manager.cancel_upload(&task.temp_id);
            }
        }
        tracing::info!(
            target: "talk::clear_conversation",
            "Cleared local state of conversation {}",
            conversation_id
        );
    }

    /// Cached messages plus a receiver for every change applied afterwards.
    pub async fn subscribe_to_conversation_updates(
        &self,
        conversation_id: &str,
    ) -> ConversationMessageSubscription {
        let updates = self.pipeline.streams.subscribe(conversation_id);
        let initial_messages = self.pipeline.cache.get_messages(conversation_id).await;
        ConversationMessageSubscription {
            initial_messages,
            updates,
        }
    }

    /// Stops the background tasks. Open controllers keep working.
    pub async fn shutdown(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(background) = background {
            background.reconnect.abort();
            background.scheduler.shutdown().await;
            tracing::info!(target: "talk::shutdown", "Background tasks stopped");
        }
    }

    /// Wipes the cache and the persisted queue.
    pub async fn delete_all_data(&self) -> Result<()> {
        for entry in self.pipeline.queue.snapshot() {
            self.pipeline.queue.remove(&entry.temp_id);
        }
        if let Some(database) = &self.database {
            database.delete_all_data().await?;
        }
        Ok(())
    }
}

impl Drop for Talk {
    fn drop(&mut self) {
        let background = self
            .background
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the scheduler closes its shutdown channel, which stops the loops.
        if let Some(background) = background {
            background.reconnect.abort();
        }
    }
}

/// Flushes the queue each time connectivity comes back.
///
/// The monitor only notifies on real transitions, so any notification that
/// finds the flag set means the connection was down since the last look.
async fn flush_on_reconnect(pipeline: Pipeline, mut online: watch::Receiver<bool>) {
    while online.changed().await.is_ok() {
        if !*online.borrow_and_update() {
            continue;
        }
        let report = pipeline.flush_outbound_queue().await;
        tracing::info!(
            target: "talk::flush_on_reconnect",
            "Back online: {} delivered, {} failed",
            report.delivered,
            report.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::talk::test_utils::InMemoryStore;
    use tempfile::TempDir;

    fn test_config(data: &TempDir, logs: &TempDir) -> TalkConfig {
        let mut config = TalkConfig::new(data.path(), logs.path(), "http://127.0.0.1:8090/");
        config.scheduler.enabled = false;
        config
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn config_uses_build_suffix_and_trims_url() {
        let config = TalkConfig::new(Path::new("/data"), Path::new("/logs"), "http://host/");
        let suffix = if cfg!(debug_assertions) { "dev" } else { "release" };

        assert_eq!(config.data_dir, Path::new("/data").join(suffix));
        assert_eq!(config.logs_dir, Path::new("/logs").join(suffix));
        assert_eq!(config.server_url, "http://host");
        assert_eq!(config.pipeline.page_size, 50);
        assert_eq!(config.pipeline.max_send_retries, 3);
        assert_eq!(config.pipeline.uploads.max_file_size, 100 * 1024 * 1024);
    }

    #[tokio::test]
    async fn reconnect_flushes_the_queue() {
        let (data, logs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let store = Arc::new(InMemoryStore::new());
        let talk = Talk::initialize(test_config(&data, &logs), store.clone())
            .await
            .unwrap();

        talk.connectivity().set_online(false);
        talk.send_message("chat", "hello").await.unwrap();
        assert_eq!(talk.outbound_queue().len(), 1);

        talk.connectivity().set_online(true);
        wait_for(|| talk.outbound_queue().is_empty()).await;

        assert_eq!(store.messages_in("chat").len(), 1);
        talk.shutdown().await;
    }

    #[tokio::test]
    async fn queued_sends_survive_a_restart() {
        let (data, logs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let store = Arc::new(InMemoryStore::new());

        let talk = Talk::initialize(test_config(&data, &logs), store.clone())
            .await
            .unwrap();
        talk.connectivity().set_online(false);
        talk.send_message("chat", "hello").await.unwrap();
        // The queue is mirrored to disk by a background writer
        tokio::time::sleep(Duration::from_millis(200)).await;
        talk.shutdown().await;
        drop(talk);

        let talk = Talk::initialize(test_config(&data, &logs), store)
            .await
            .unwrap();
        let queued = talk.outbound_queue().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].content, "hello");
        talk.shutdown().await;
    }

    #[tokio::test]
    async fn blank_messages_are_refused() {
        let (data, logs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let talk = Talk::initialize(test_config(&data, &logs), Arc::new(InMemoryStore::new()))
            .await
            .unwrap();

        let result = talk.send_message("chat", "   ").await;

        assert!(matches!(
            result,
            Err(TalkError::Queue(QueueError::EmptyMessage))
        ));
        assert!(talk.outbound_queue().is_empty());
    }

    #[tokio::test]
    async fn retry_of_unknown_message_is_an_error() {
        let (data, logs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let talk = Talk::initialize(test_config(&data, &logs), Arc::new(InMemoryStore::new()))
            .await
            .unwrap();

        assert!(matches!(
            talk.retry_message("temp_missing").await,
            Err(TalkError::Queue(QueueError::UnknownEntry(_)))
        ));
    }

    #[tokio::test]
    async fn clear_conversation_drops_queue_and_cache() {
        let (data, logs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let talk = Talk::initialize(test_config(&data, &logs), Arc::new(InMemoryStore::new()))
            .await
            .unwrap();
        talk.connectivity().set_online(false);
        talk.send_message("chat", "hello").await.unwrap();
        talk.send_message("other", "hi").await.unwrap();
        talk.cache()
            .add_message(&test_utils::make_message("m1", "chat", 1_000))
            .await;

        talk.clear_conversation("chat").await;

        assert_eq!(talk.outbound_queue().len(), 1);
        assert!(talk.cache().get_messages("chat").await.is_empty());
    }

    #[tokio::test]
    async fn conversation_subscribers_see_confirmed_sends() {
        let (data, logs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let talk = Talk::initialize(test_config(&data, &logs), Arc::new(InMemoryStore::new()))
            .await
            .unwrap();
        let mut subscription = talk.subscribe_to_conversation_updates("chat").await;
        assert!(subscription.initial_messages.is_empty());

        talk.send_message("chat", "hello").await.unwrap();

        let update = subscription.updates.recv().await.unwrap();
        assert_eq!(update.trigger, UpdateTrigger::MessageSent);
        assert_eq!(update.message.content, "hello");
    }

    #[tokio::test]
    async fn upload_managers_are_shared_per_conversation() {
        let (data, logs) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let store = Arc::new(InMemoryStore::new());
        store.set_upload_delay(Duration::from_secs(10));
        let talk = Talk::initialize(test_config(&data, &logs), store)
            .await
            .unwrap();

        let file = uploads::AttachmentFile {
            filename: "a.png".to_string(),
            mime_type: "image/png".to_string(),
            path: PathBuf::from("/tmp/a.png"),
            size: 10,
        };
        talk.upload_manager("chat")
            .upload_files(vec![file], messages::MessageKind::Image, None)
            .unwrap();

        assert_eq!(talk.upload_manager("chat").tasks().len(), 1);
        assert!(talk.upload_manager("other").tasks().is_empty());
    }
}
