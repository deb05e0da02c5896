//! Outbound Queue
//!
//! Holds text messages the user asked to send until the server confirms them.
//! Every mutation is a single step under the queue lock and is followed by a
//! snapshot broadcast, so subscribers never observe a half-applied change and
//! never hold a live reference into the queue.
//!
//! When a database is attached, a dedicated writer task mirrors each snapshot
//! into the `pending_messages` table so queued sends survive a restart.

mod types;

pub use types::{PendingMessage, PendingStatus, QueueError, QueueRunReport, QueueSnapshot};

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use super::database::Database;
use super::messages::Message;
use super::utils::generate_temp_id;

const BUFFER_SIZE: usize = 100;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct OutboundQueue {
    entries: Mutex<Vec<PendingMessage>>,
    updates: broadcast::Sender<QueueSnapshot>,
    processing: AtomicBool,
    max_retries: u32,
}

/// Releases the re-entrancy flag even if the pass is cancelled mid-await.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutboundQueue {
    /// Creates an in-memory queue. Entries are lost when the process exits.
    pub fn new(max_retries: u32) -> Self {
        Self::with_entries(Vec::new(), max_retries)
    }

    fn with_entries(entries: Vec<PendingMessage>, max_retries: u32) -> Self {
        Self {
            entries: Mutex::new(entries),
            updates: broadcast::channel(BUFFER_SIZE).0,
            processing: AtomicBool::new(false),
            max_retries,
        }
    }

    /// Restores the persisted queue and keeps the table in sync from now on.
    ///
    /// Entries that were mid-send when the process stopped go back to `pending`;
    /// the server may or may not have received them (at-least-once delivery).
    pub async fn restore(database: Arc<Database>, max_retries: u32) -> Arc<Self> {
        let mut entries = match PendingMessage::load_all(&database).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    target: "talk::outbound_queue::restore",
                    "Failed to load persisted queue, starting empty: {}",
                    e
                );
                Vec::new()
            }
        };
        for entry in entries.iter_mut() {
            if entry.status == PendingStatus::Sending {
                entry.status = PendingStatus::Pending;
            }
        }

        tracing::debug!(
            target: "talk::outbound_queue::restore",
            "Restored {} queued messages",
            entries.len()
        );

        let queue = Arc::new(Self::with_entries(entries, max_retries));
        queue.spawn_persister(database);
        queue
    }

    fn spawn_persister(&self, database: Arc<Database>) {
        let mut receiver = self.updates.subscribe();
        tokio::spawn(async move {
            loop {
                let mut latest = match receiver.recv().await {
                    Ok(snapshot) => snapshot,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                // Only the newest snapshot matters; skip intermediate ones.
                while let Ok(newer) = receiver.try_recv() {
                    latest = newer;
                }
                if let Err(e) = PendingMessage::replace_all(&latest, &database).await {
                    tracing::warn!(
                        target: "talk::outbound_queue::persist",
                        "Failed to persist queue snapshot: {}",
                        e
                    );
                }
            }
        });
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Registers a listener; every later mutation delivers a fresh snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueSnapshot> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.lock().clone()
    }

    pub fn pending_for(&self, conversation_id: &str) -> Vec<PendingMessage> {
        self.lock()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Appends a new `pending` entry and returns its temporary id.
    pub fn add(&self, conversation_id: &str, content: &str) -> String {
        let temp_id = generate_temp_id();
        self.mutate(|entries| {
            entries.push(PendingMessage::new(
                temp_id.clone(),
                conversation_id.to_string(),
                content.to_string(),
            ));
            true
        });
        tracing::debug!(
            target: "talk::outbound_queue::add",
            "Queued message {} for conversation {}",
            temp_id,
            conversation_id
        );
        temp_id
    }

    /// Sets the status of an entry, optionally stamping the server id.
    pub fn update_status(&self, temp_id: &str, status: PendingStatus, real_id: Option<String>) {
        self.mutate(|entries| match find_mut(entries, temp_id) {
            Some(entry) => {
                entry.status = status;
                if real_id.is_some() {
                    entry.real_id = real_id;
                }
                true
            }
            None => false,
        });
    }

    pub fn increment_retry(&self, temp_id: &str) {
        self.mutate(|entries| match find_mut(entries, temp_id) {
            Some(entry) => {
                entry.retries += 1;
                true
            }
            None => false,
        });
    }

    pub fn remove(&self, temp_id: &str) {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|m| m.temp_id != temp_id);
            entries.len() != before
        });
    }

    /// Drops every entry of a conversation (the conversation was deleted or cleared).
    pub fn clear_chat(&self, conversation_id: &str) {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|m| m.conversation_id != conversation_id);
            entries.len() != before
        });
    }

    /// Manual resend: puts an entry back in play regardless of its retry count.
    pub fn retry(&self, temp_id: &str) -> bool {
        self.mutate(|entries| match find_mut(entries, temp_id) {
            Some(entry) if entry.status != PendingStatus::Sending => {
                entry.retries = 0;
                entry.status = PendingStatus::Pending;
                true
            }
            _ => false,
        })
    }

    /// Attempts every `pending`/`failed` entry below the retry ceiling.
    ///
    /// Passes never overlap: a call made while another pass is running returns
    /// a skipped report immediately. Entries removed while the pass runs are not attempted.
    pub async fn process_queue<F, Fut, E>(&self, send: F, is_online: bool) -> QueueRunReport
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = Result<Message, E>>,
        E: Display,
    {
        if !is_online || self.is_empty() {
            return QueueRunReport::skipped();
        }

        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            tracing::debug!(
                target: "talk::outbound_queue::process_queue",
                "Queue pass already running, skipping"
            );
            return QueueRunReport::skipped();
        };

        let candidates: Vec<PendingMessage> = self
            .lock()
            .iter()
            .filter(|m| m.is_retryable(self.max_retries))
            .cloned()
            .collect();

        let mut report = QueueRunReport::default();

        for candidate in candidates {
            if !self.mark_sending(&candidate.temp_id) {
                continue;
            }
            report.attempted += 1;

            match send(candidate.conversation_id.clone(), candidate.content.clone()).await {
                Ok(message) => {
                    self.update_status(
                        &candidate.temp_id,
                        PendingStatus::Sending,
                        Some(message.id.clone()),
                    );
                    self.remove(&candidate.temp_id);
                    report.delivered += 1;
                    report.confirmed.push(message);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "talk::outbound_queue::process_queue",
                        "Failed to send queued message {} (attempt {}/{}): {}",
                        candidate.temp_id,
                        candidate.retries + 1,
                        self.max_retries,
                        e
                    );
                    self.increment_retry(&candidate.temp_id);
                    self.update_status(&candidate.temp_id, PendingStatus::Failed, None);
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            target: "talk::outbound_queue::process_queue",
            "Queue pass finished: {} attempted, {} delivered, {} failed",
            report.attempted,
            report.delivered,
            report.failed
        );
        report
    }

    /// Flips a still-retryable entry to `sending`. False when it vanished or changed meanwhile.
    fn mark_sending(&self, temp_id: &str) -> bool {
        let max_retries = self.max_retries;
        self.mutate(|entries| match find_mut(entries, temp_id) {
            Some(entry) if entry.is_retryable(max_retries) => {
                entry.status = PendingStatus::Sending;
                true
            }
            _ => false,
        })
    }

    /// Applies `change` under the lock and broadcasts a snapshot if it reported a change.
    fn mutate(&self, change: impl FnOnce(&mut Vec<PendingMessage>) -> bool) -> bool {
        let mut entries = self.lock();
        let changed = change(&mut entries);
        if changed {
            // No receivers is fine
            let _ = self.updates.send(entries.clone());
        }
        changed
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

fn find_mut<'a>(entries: &'a mut [PendingMessage], temp_id: &str) -> Option<&'a mut PendingMessage> {
    entries.iter_mut().find(|m| m.temp_id == temp_id)
}
