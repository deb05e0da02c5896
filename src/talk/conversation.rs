//! Message list controller for one open conversation.
//!
//! Combines the cache snapshot, authoritative history, realtime events and the
//! outbound queue into a single [`MessageListSnapshot`] published on a watch
//! channel. All list mutations go through one mutex that is never held across
//! an await.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::Pipeline;
use super::error::{Result, TalkError};
use super::history::HistoryError;
use super::message_list::MessageList;
use super::message_streaming::{
    MessageUpdate, RealtimeEvent, RealtimeReconciler, ReconcileOutcome, SubscriptionState,
    UpdateTrigger, apply_event,
};
use super::messages::Message;
use super::outbound_queue::{PendingMessage, QueueSnapshot};
use crate::store::StoreSubscription;

/// What the UI renders for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListSnapshot {
    pub conversation_id: String,
    /// Confirmed messages, oldest first
    pub messages: Vec<Message>,
    /// Queued sends not yet visible as confirmed messages
    pub pending_messages: Vec<PendingMessage>,
    pub loading: bool,
    pub loading_older: bool,
    pub has_more: bool,
    pub has_more_after: bool,
    /// Index of the anchor in `messages` for controllers opened on an anchor
    pub target_index: Option<usize>,
    pub subscription: SubscriptionState,
}

#[derive(Debug, Default)]
struct ControllerState {
    list: MessageList,
    queued: Vec<PendingMessage>,
    /// Entries already removed from the queue whose confirmed message has not reached the list yet
    confirming: Vec<PendingMessage>,
    loading: bool,
    loading_older: bool,
    has_more: bool,
    has_more_after: bool,
    target_index: Option<usize>,
    subscription: SubscriptionState,
    /// Events applied while a full load is in flight, replayed on top of its result
    in_flight: Option<Vec<RealtimeEvent>>,
}

impl ControllerState {
    fn apply(&mut self, event: &RealtimeEvent) -> ReconcileOutcome {
        if let Some(events) = self.in_flight.as_mut() {
            events.push(event.clone());
        }
        let outcome = apply_event(&mut self.list, event);
        if outcome.changed() {
            self.settle_confirming();
        }
        outcome
    }

    /// Replaces the list with an authoritative result and replays what arrived meanwhile.
    fn finish_load(&mut self, messages: Vec<Message>) {
        self.list.replace_all(messages);
        for event in self.in_flight.take().unwrap_or_default() {
            apply_event(&mut self.list, &event);
        }
        self.loading = false;
        self.settle_confirming();
    }

    fn set_queue(&mut self, entries: Vec<PendingMessage>) {
        for previous in self.queued.drain(..) {
            let gone = !entries.iter().any(|e| e.temp_id == previous.temp_id);
            let awaiting = previous
                .real_id
                .as_deref()
                .is_some_and(|id| !self.list.contains(id));
            if gone && awaiting {
                self.confirming.push(previous);
            }
        }
        self.queued = entries;
        self.settle_confirming();
    }

    fn settle_confirming(&mut self) {
        let list = &self.list;
        self.confirming.retain(|p| {
            p.real_id
                .as_deref()
                .is_some_and(|id| !list.contains(id))
        });
    }

    fn snapshot(&self, conversation_id: &str) -> MessageListSnapshot {
        let pending_messages = self
            .queued
            .iter()
            .chain(&self.confirming)
            .filter(|p| {
                p.real_id
                    .as_deref()
                    .is_none_or(|id| !self.list.contains(id))
            })
            .cloned()
            .collect();

        MessageListSnapshot {
            conversation_id: conversation_id.to_string(),
            messages: self.list.to_vec(),
            pending_messages,
            loading: self.loading,
            loading_older: self.loading_older,
            has_more: self.has_more,
            has_more_after: self.has_more_after,
            target_index: self.target_index,
            subscription: self.subscription,
        }
    }
}

struct Shared {
    conversation_id: String,
    anchor: Option<String>,
    pipeline: Pipeline,
    reconciler: RealtimeReconciler,
    state: Mutex<ControllerState>,
    snapshots: watch::Sender<MessageListSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutates the state and publishes the resulting snapshot under the same lock.
    fn update<R>(&self, change: impl FnOnce(&mut ControllerState) -> R) -> R {
        let mut state = self.lock();
        let result = change(&mut state);
        self.snapshots
            .send_replace(state.snapshot(&self.conversation_id));
        result
    }

    fn queue_entries(&self, snapshot: QueueSnapshot) -> Vec<PendingMessage> {
        snapshot
            .into_iter()
            .filter(|p| p.conversation_id == self.conversation_id)
            .collect()
    }

    async fn load_initial(&self) -> Result<()> {
        let had_snapshot = self.update(|state| {
            state.loading = true;
            state.in_flight = Some(Vec::new());
            !state.list.is_empty()
        });

        match &self.anchor {
            Some(anchor) => self.load_anchored(anchor).await,
            None => self.load_latest(had_snapshot).await,
        }
    }

    async fn load_latest(&self, had_snapshot: bool) -> Result<()> {
        let mut painted = had_snapshot;
        if !painted {
            let cached = self
                .pipeline
                .cache
                .get_messages(&self.conversation_id)
                .await;
            if !cached.is_empty() {
                tracing::debug!(
                    target: "talk::conversation::load_latest",
                    "Painting {} cached messages for {}",
                    cached.len(),
                    self.conversation_id
                );
                self.update(|state| {
                    state.list.merge(cached);
                });
                painted = true;
            }
        }

        match self.pipeline.history.load_latest(&self.conversation_id).await {
            Ok(page) => {
                self.update(|state| {
                    state.finish_load(page.messages.clone());
                    state.has_more = page.has_more_older;
                    state.has_more_after = false;
                    state.target_index = None;
                });
                self.pipeline
                    .cache
                    .save_messages(&self.conversation_id, &page.messages)
                    .await;
                Ok(())
            }
            Err(e) if painted => {
                tracing::warn!(
                    target: "talk::conversation::load_latest",
                    "Failed to fetch latest messages for {}, keeping cached copy: {}",
                    self.conversation_id,
                    e
                );
                self.update(|state| {
                    state.in_flight = None;
                    state.loading = false;
                });
                Ok(())
            }
            Err(e) => {
                self.update(|state| {
                    state.in_flight = None;
                    state.loading = false;
                });
                Err(e.into())
            }
        }
    }

    async fn load_anchored(&self, anchor: &str) -> Result<()> {
        let window_size = self.pipeline.config.around_window;
        let result = self
            .pipeline
            .history
            .load_around(anchor, window_size)
            .await
            .and_then(|window| {
                if window.anchor.conversation_id == self.conversation_id {
                    Ok(window)
                } else {
                    Err(HistoryError::AnchorOutsideConversation {
                        message_id: window.anchor.id.clone(),
                        expected: self.conversation_id.clone(),
                        actual: window.anchor.conversation_id.clone(),
                    })
                }
            });

        match result {
            Ok(window) => {
                self.update(|state| {
                    state.finish_load(window.messages);
                    state.has_more = window.has_more_before;
                    state.has_more_after = window.has_more_after;
                    state.target_index = state.list.iter().position(|m| m.id == window.anchor.id);
                });
                Ok(())
            }
            Err(e) => {
                self.update(|state| {
                    state.in_flight = None;
                    state.loading = false;
                });
                Err(e.into())
            }
        }
    }
}

/// A live view of one conversation.
///
/// Dropping the controller stops its realtime subscription and watchers.
pub struct ConversationController {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConversationController {
    /// Subscribes, paints, and loads a conversation.
    ///
    /// With an `anchor`, the list is a window around that message and the cache
    /// is left alone. Fails when the authoritative load fails and there is no
    /// cached copy to fall back on, or when the anchor cannot be resolved.
    pub async fn open(
        pipeline: Pipeline,
        conversation_id: &str,
        anchor: Option<&str>,
    ) -> Result<Self> {
        let reconciler = RealtimeReconciler::new(
            pipeline.store.clone(),
            pipeline.cache.clone(),
            pipeline.streams.clone(),
        );

        let queue_updates = pipeline.queue.subscribe();
        let sent_updates = pipeline.streams.subscribe(conversation_id);

        let state = ControllerState {
            loading: true,
            subscription: SubscriptionState::Subscribing,
            ..Default::default()
        };
        let shared = Arc::new(Shared {
            conversation_id: conversation_id.to_string(),
            anchor: anchor.map(str::to_string),
            reconciler,
            state: Mutex::new(state),
            snapshots: watch::channel(MessageListSnapshot::default()).0,
            pipeline,
        });
        let initial_queue = shared.queue_entries(shared.pipeline.queue.snapshot());
        shared.update(|state| state.set_queue(initial_queue));

        let mut tasks = vec![
            tokio::spawn(watch_queue(Arc::clone(&shared), queue_updates)),
            tokio::spawn(watch_sent(Arc::clone(&shared), sent_updates)),
        ];

        match shared.pipeline.store.subscribe(conversation_id).await {
            Ok(subscription) => {
                shared.update(|state| state.subscription = SubscriptionState::Active);
                tasks.push(tokio::spawn(run_realtime(Arc::clone(&shared), subscription)));
            }
            Err(e) => {
                tracing::warn!(
                    target: "talk::conversation::open",
                    "Realtime subscription for {} failed, continuing without live updates: {}",
                    conversation_id,
                    e
                );
                shared.update(|state| state.subscription = SubscriptionState::Unsubscribed);
            }
        }

        let controller = Self { shared, tasks };
        controller.shared.load_initial().await?;

        tracing::debug!(
            target: "talk::conversation::open",
            "Opened conversation {} with {} messages",
            conversation_id,
            controller.snapshot().messages.len()
        );
        Ok(controller)
    }

    pub fn conversation_id(&self) -> &str {
        &self.shared.conversation_id
    }

    pub fn snapshot(&self) -> MessageListSnapshot {
        self.shared.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MessageListSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Prepends the page before the oldest loaded message. Returns how many
    /// messages were new; 0 when nothing older exists or a load is running.
    pub async fn load_older_messages(&self) -> Result<usize> {
        let before = self.shared.update(|state| {
            if state.loading || state.loading_older || !state.has_more {
                return None;
            }
            let before = state.list.oldest()?.created_at;
            state.loading_older = true;
            Some(before)
        });
        let Some(before) = before else {
            return Ok(0);
        };

        let result = self
            .shared
            .pipeline
            .history
            .load_older(&self.shared.conversation_id, before)
            .await;

        self.shared.update(|state| {
            state.loading_older = false;
            match result {
                Ok(page) => {
                    let inserted = state.list.merge(page.messages);
                    state.has_more = page.has_more_older;
                    if let Some(index) = state.target_index.as_mut() {
                        *index += inserted;
                    }
                    state.settle_confirming();
                    Ok(inserted)
                }
                Err(e) => Err(TalkError::from(e)),
            }
        })
    }

    /// Refetches the authoritative list, keeping realtime changes that land meanwhile.
    pub async fn reload(&self) -> Result<()> {
        self.shared.load_initial().await
    }

    /// Queues a text message in this conversation and returns its temp id.
    pub async fn send_text(&self, text: &str) -> Result<String> {
        self.shared
            .pipeline
            .send_message(&self.shared.conversation_id, text)
            .await
    }

    /// Stops live updates. The last snapshot stays readable.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared
            .update(|state| state.subscription = SubscriptionState::Unsubscribed);
        tracing::debug!(
            target: "talk::conversation::close",
            "Closed conversation {}",
            self.shared.conversation_id
        );
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_realtime(shared: Arc<Shared>, mut subscription: StoreSubscription) {
    while let Some(record) = subscription.recv().await {
        let event = match RealtimeEvent::try_from(record) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    target: "talk::conversation::run_realtime",
                    "Dropping malformed realtime event: {}",
                    e
                );
                continue;
            }
        };
        if event.conversation_id() != shared.conversation_id {
            continue;
        }

        shared
            .reconciler
            .reconcile(event, |event| shared.update(|state| state.apply(event)))
            .await;
    }

    tracing::info!(
        target: "talk::conversation::run_realtime",
        "Realtime stream for {} ended",
        shared.conversation_id
    );
    shared.update(|state| state.subscription = SubscriptionState::Unsubscribed);
}

async fn watch_queue(shared: Arc<Shared>, mut updates: broadcast::Receiver<QueueSnapshot>) {
    loop {
        let snapshot = match updates.recv().await {
            Ok(snapshot) => snapshot,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(
                    target: "talk::conversation::watch_queue",
                    "Missed {} queue snapshots, resyncing",
                    skipped
                );
                shared.pipeline.queue.snapshot()
            }
            Err(RecvError::Closed) => break,
        };
        let entries = shared.queue_entries(snapshot);
        shared.update(|state| state.set_queue(entries));
    }
}

async fn watch_sent(shared: Arc<Shared>, mut updates: broadcast::Receiver<MessageUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) if update.trigger == UpdateTrigger::MessageSent => {
                let event = RealtimeEvent::Created(update.message);
                shared.update(|state| state.apply(&event));
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
