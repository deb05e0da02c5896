//! Realtime Reconciler
//!
//! Applies pushed changes to a conversation's in-memory list in three steps so
//! the list lock is never held across I/O:
//!
//! 1. resolve: fetch the expanded record when needed.
//! 2. apply: mutate the list synchronously (usually through [`apply_event`]).
//! 3. commit: refresh the cache and notify subscribers.
//!
//! Merging is keyed by message id only, so duplicate pushes and the race
//! between a confirmed send and its own echo converge on a single entry.

use std::sync::Arc;

use super::manager::MessageStreamManager;
use super::types::{MessageUpdate, RealtimeEvent, UpdateTrigger};
use crate::store::MessageStore;
use crate::talk::message_cache::MessageCache;
use crate::talk::message_list::MessageList;
use crate::talk::messages::Message;

/// What applying an event did to the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    Replaced,
    Removed(Message),
    Ignored,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, ReconcileOutcome::Ignored)
    }
}

/// Applies a resolved event to `list`.
///
/// Creates are inserted only when the id is new. Updates and deletes for ids
/// outside the list are ignored rather than inserted out of context.
pub fn apply_event(list: &mut MessageList, event: &RealtimeEvent) -> ReconcileOutcome {
    match event {
        RealtimeEvent::Created(message) => {
            if list.insert_if_absent(message.clone()) {
                ReconcileOutcome::Inserted
            } else {
                ReconcileOutcome::Ignored
            }
        }
        RealtimeEvent::Updated(message) => {
            if list.replace_existing(message.clone()) {
                ReconcileOutcome::Replaced
            } else {
                ReconcileOutcome::Ignored
            }
        }
        RealtimeEvent::Deleted { id, .. } => match list.remove(id) {
            Some(removed) => ReconcileOutcome::Removed(removed),
            None => ReconcileOutcome::Ignored,
        },
    }
}

#[derive(Clone)]
pub struct RealtimeReconciler {
    store: Arc<dyn MessageStore>,
    cache: MessageCache,
    streams: Arc<MessageStreamManager>,
}

impl RealtimeReconciler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        cache: MessageCache,
        streams: Arc<MessageStreamManager>,
    ) -> Self {
        Self {
            store,
            cache,
            streams,
        }
    }

    /// Swaps a pushed record for its expanded form, keeping the pushed copy if the fetch fails.
    async fn resolve(&self, event: RealtimeEvent) -> RealtimeEvent {
        match event {
            RealtimeEvent::Created(message) => RealtimeEvent::Created(self.expand(message).await),
            RealtimeEvent::Updated(message) => RealtimeEvent::Updated(self.expand(message).await),
            deleted @ RealtimeEvent::Deleted { .. } => deleted,
        }
    }

    async fn expand(&self, message: Message) -> Message {
        if message.is_expanded() {
            return message;
        }
        match self.store.get_message(&message.id).await {
            Ok(expanded) => expanded,
            Err(e) => {
                tracing::warn!(
                    target: "talk::message_streaming::reconciler::expand",
                    "Failed to fetch expanded message {}, using pushed record: {}",
                    message.id,
                    e
                );
                message
            }
        }
    }

    /// Best-effort side effects of an applied event.
    async fn commit(&self, event: &RealtimeEvent, outcome: &ReconcileOutcome) {
        match (event, outcome) {
            (RealtimeEvent::Created(message), ReconcileOutcome::Inserted) => {
                self.cache.add_message(message).await;
                self.streams.emit(
                    &message.conversation_id,
                    MessageUpdate::new(UpdateTrigger::NewMessage, message.clone()),
                );
            }
            (RealtimeEvent::Updated(message), ReconcileOutcome::Replaced) => {
                self.cache.add_message(message).await;
                self.streams.emit(
                    &message.conversation_id,
                    MessageUpdate::new(UpdateTrigger::MessageUpdated, message.clone()),
                );
            }
            (RealtimeEvent::Deleted { conversation_id, .. }, ReconcileOutcome::Removed(removed)) => {
                self.streams.emit(
                    conversation_id,
                    MessageUpdate::new(UpdateTrigger::MessageDeleted, removed.clone()),
                );
            }
            _ => {}
        }

        // A deleted message must not reappear from the cache on the next open.
        if let RealtimeEvent::Deleted { id, .. } = event {
            self.cache.remove_message(id).await;
        }
    }

    /// Resolves `event`, hands it to `apply` and commits the outcome.
    ///
    /// `apply` runs synchronously between the two awaits, so callers can mutate
    /// their list under a lock without holding it across I/O.
    pub async fn reconcile<F>(&self, event: RealtimeEvent, apply: F) -> ReconcileOutcome
    where
        F: FnOnce(&RealtimeEvent) -> ReconcileOutcome,
    {
        let event = self.resolve(event).await;
        let outcome = apply(&event);
        tracing::trace!(
            target: "talk::message_streaming::reconciler::reconcile",
            "Applied realtime event for {}: {:?}",
            event.message_id(),
            outcome
        );
        self.commit(&event, &outcome).await;
        outcome
    }
}
