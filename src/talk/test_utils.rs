use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::Pipeline;
use super::PipelineConfig;
use super::connectivity::ConnectionMonitor;
use super::database::Database;
use super::message_cache::MessageCache;
use super::messages::{Message, MessageKind};
use super::outbound_queue::{DEFAULT_MAX_RETRIES, OutboundQueue};
use super::uploads::AttachmentFile;
use crate::store::{
    MessagePage, MessageQuery, MessageStore, RecordEvent, Result, SortOrder, StoreError,
    StoreSubscription,
};

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

/// A plain text message from "alice" whose sender is not expanded.
pub(crate) fn make_message(id: &str, conversation_id: &str, created_ms: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: Some("alice".to_string()),
        kind: MessageKind::Text,
        content: format!("message {id}"),
        attachment: None,
        reactions: Default::default(),
        favs: Vec::new(),
        reply_to: None,
        forwarded_from: None,
        sender_profile: None,
        created_at: timestamp(created_ms),
        updated_at: timestamp(created_ms),
    }
}

pub(crate) async fn create_test_database() -> (Database, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::new(dir.path().join("test.sqlite"))
        .await
        .expect("Failed to create test database");
    (database, dir)
}

/// An online pipeline over an [`InMemoryStore`] with no cache.
pub(crate) fn create_test_pipeline() -> (Pipeline, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        store.clone(),
        MessageCache::disabled(),
        Arc::new(OutboundQueue::new(DEFAULT_MAX_RETRIES)),
        ConnectionMonitor::new(true),
    );
    (pipeline, store)
}

/// Like [`create_test_pipeline`] but with an on-disk cache.
pub(crate) async fn create_test_pipeline_with_cache() -> (Pipeline, Arc<InMemoryStore>, TempDir) {
    let (database, dir) = create_test_database().await;
    let store = Arc::new(InMemoryStore::new());
    let pipeline = Pipeline::new(
        PipelineConfig::default(),
        store.clone(),
        MessageCache::new(Arc::new(database)),
        Arc::new(OutboundQueue::new(DEFAULT_MAX_RETRIES)),
        ConnectionMonitor::new(true),
    );
    (pipeline, store, dir)
}

#[derive(Default)]
struct StoreState {
    messages: BTreeMap<String, Message>,
    subscribers: HashMap<String, Vec<mpsc::Sender<RecordEvent>>>,
    unreachable: bool,
    no_echo: bool,
    fail_lists: usize,
    fail_creates: usize,
    fail_uploads: usize,
    list_delay: Duration,
    upload_delay: Duration,
    get_calls: usize,
    create_calls: usize,
    upload_calls: usize,
    next_id: u64,
    last_created_ms: i64,
}

impl StoreState {
    /// Server-side creation time: wall clock, strictly increasing, millisecond precision.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let ms = Utc::now().timestamp_millis().max(self.last_created_ms + 1);
        self.last_created_ms = ms;
        timestamp(ms)
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("srv{:04}", self.next_id)
    }

    fn subscribers_of(&mut self, conversation_id: &str) -> Vec<mpsc::Sender<RecordEvent>> {
        let senders = self
            .subscribers
            .entry(conversation_id.to_string())
            .or_default();
        senders.retain(|tx| !tx.is_closed());
        senders.clone()
    }
}

fn injected_failure() -> StoreError {
    StoreError::Status {
        status: 503,
        message: "injected failure".to_string(),
    }
}

/// A [`MessageStore`] double with failure injection, call counters and a
/// realtime feed that echoes creates to subscribers of the conversation.
#[derive(Default)]
pub(crate) struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn insert(&self, message: Message) {
        self.lock().messages.insert(message.id.clone(), message);
    }

    /// Stored messages of a conversation, oldest first.
    pub(crate) fn messages_in(&self, conversation_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .lock()
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        messages
    }

    pub(crate) fn fail_next_lists(&self, count: usize) {
        self.lock().fail_lists = count;
    }

    pub(crate) fn fail_next_creates(&self, count: usize) {
        self.lock().fail_creates = count;
    }

    pub(crate) fn fail_next_uploads(&self, count: usize) {
        self.lock().fail_uploads = count;
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Whether creates are pushed back to realtime subscribers (on by default).
    pub(crate) fn set_echo(&self, echo: bool) {
        self.lock().no_echo = !echo;
    }

    /// Delay applied after a list result is computed, before it is returned.
    pub(crate) fn set_list_delay(&self, delay: Duration) {
        self.lock().list_delay = delay;
    }

    pub(crate) fn set_upload_delay(&self, delay: Duration) {
        self.lock().upload_delay = delay;
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub(crate) fn upload_calls(&self) -> usize {
        self.lock().upload_calls
    }

    /// Pushes a realtime event to the subscribers of the message's conversation.
    pub(crate) fn push_event(&self, action: &str, message: &Message) {
        let senders = self.lock().subscribers_of(&message.conversation_id);
        let event = RecordEvent::new(action, message);
        for tx in senders {
            let _ = tx.try_send(event.clone());
        }
    }

    /// Stores a server-created message and echoes it like the realtime feed would.
    fn store_created(&self, message: Message) {
        let echo = {
            let mut state = self.lock();
            state.messages.insert(message.id.clone(), message.clone());
            !state.no_echo
        };
        if echo {
            self.push_event("create", &message);
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_message(&self, conversation_id: &str, content: &str) -> Result<Message> {
        let message = {
            let mut state = self.lock();
            state.create_calls += 1;
            if state.fail_creates > 0 {
                state.fail_creates -= 1;
                return Err(injected_failure());
            }
            let created_at = state.next_created_at();
            Message {
                id: state.next_id(),
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
                created_at,
                updated_at: created_at,
                ..make_message("", conversation_id, 0)
            }
        };
        self.store_created(message.clone());
        Ok(message)
    }

    async fn create_message_with_attachment(
        &self,
        conversation_id: &str,
        kind: MessageKind,
        file: &AttachmentFile,
        caption: Option<&str>,
    ) -> Result<Message> {
        let (fail, delay) = {
            let mut state = self.lock();
            state.upload_calls += 1;
            let fail = state.fail_uploads > 0;
            if fail {
                state.fail_uploads -= 1;
            }
            (fail, state.upload_delay)
        };

        tokio::time::sleep(delay).await;
        if fail {
            return Err(injected_failure());
        }

        let message = {
            let mut state = self.lock();
            let created_at = state.next_created_at();
            Message {
                id: state.next_id(),
                kind,
                content: caption.unwrap_or_default().to_string(),
                attachment: Some(file.filename.clone()),
                created_at,
                updated_at: created_at,
                ..make_message("", conversation_id, 0)
            }
        };
        self.store_created(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<MessagePage> {
        let (page, delay) = {
            let mut state = self.lock();
            if state.fail_lists > 0 {
                state.fail_lists -= 1;
                return Err(injected_failure());
            }

            let mut matching: Vec<Message> = state
                .messages
                .values()
                .filter(|m| query.matches(m))
                .cloned()
                .collect();
            matching.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            if query.sort == SortOrder::NewestFirst {
                matching.reverse();
            }

            let per_page = query.per_page.max(1);
            let total_items = matching.len() as u64;
            let total_pages = total_items.div_ceil(u64::from(per_page)) as u32;
            let items = matching
                .into_iter()
                .skip(((query.page - 1) * per_page) as usize)
                .take(per_page as usize)
                .collect();

            (
                MessagePage {
                    items,
                    page: query.page,
                    per_page,
                    total_items,
                    total_pages,
                },
                state.list_delay,
            )
        };

        tokio::time::sleep(delay).await;
        Ok(page)
    }

    async fn get_message(&self, message_id: &str) -> Result<Message> {
        let mut state = self.lock();
        state.get_calls += 1;
        state
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))
    }

    async fn subscribe(&self, conversation_id: &str) -> Result<StoreSubscription> {
        let (tx, rx) = mpsc::channel(64);
        self.lock()
            .subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        Ok(StoreSubscription::new(rx, None))
    }

    async fn search(&self, conversation_id: &str, query: &str, per_page: u32) -> Result<MessagePage> {
        let mut items: Vec<Message> = self
            .messages_in(conversation_id)
            .into_iter()
            .filter(|m| m.content.contains(query))
            .collect();
        items.reverse();
        let total_items = items.len() as u64;
        items.truncate(per_page as usize);

        Ok(MessagePage {
            items,
            page: 1,
            per_page,
            total_items,
            total_pages: u32::from(total_items > 0),
        })
    }

    async fn health_check(&self) -> Result<()> {
        if self.lock().unreachable {
            Err(StoreError::Status {
                status: 503,
                message: "unreachable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}
