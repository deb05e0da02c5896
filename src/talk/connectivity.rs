use std::sync::Arc;

use tokio::sync::watch;

use crate::store::MessageStore;

/// Shared online/offline flag.
///
/// The host sets it from platform signals; the connectivity probe task keeps it
/// honest against the store's health endpoint.
#[derive(Clone, Debug)]
pub struct ConnectionMonitor {
    online: Arc<watch::Sender<bool>>,
}

impl ConnectionMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: Arc::new(watch::channel(initially_online).0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Returns true when the flag actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(
                target: "talk::connectivity::set_online",
                "Connection is now {}",
                if online { "online" } else { "offline" }
            );
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Pings the store and records the result.
    pub async fn probe(&self, store: &dyn MessageStore) -> bool {
        let online = match store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    target: "talk::connectivity::probe",
                    "Health check failed: {}",
                    e
                );
                false
            }
        };
        self.set_online(online);
        online
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
