//! In-memory platform services.
//!
//! `MemoryNotifications` applies the platform's replace-by-tag display
//! rule and keeps a history of everything shown; `MemoryClients` tracks
//! open windows. The command-line host renders from these, and the tests
//! assert against them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use url::Url;

use super::{ClientId, ClientInfo, ClientKind, ClientRegistry, NotificationPlatform};
use crate::error::{Result, WorkerError};
use crate::models::{NotificationId, NotificationOptions, NotificationRecord};

/// Buffer size for the display broadcast channel.
const DISPLAY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct TrayState {
    visible: Vec<NotificationRecord>,
    history: Vec<NotificationRecord>,
}

/// Notification tray held in memory.
#[derive(Debug)]
pub struct MemoryNotifications {
    next_id: AtomicU64,
    state: Mutex<TrayState>,
    displayed_tx: broadcast::Sender<NotificationRecord>,
}

impl MemoryNotifications {
    pub fn new() -> Self {
        let (displayed_tx, _) = broadcast::channel(DISPLAY_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TrayState::default()),
            displayed_tx,
        }
    }

    /// Receive every notification as it is displayed.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationRecord> {
        self.displayed_tx.subscribe()
    }

    pub async fn visible(&self) -> Vec<NotificationRecord> {
        self.state.lock().await.visible.clone()
    }

    /// Every notification ever displayed, in display order.
    pub async fn history(&self) -> Vec<NotificationRecord> {
        self.state.lock().await.history.clone()
    }

    /// The user swiping a notification away.
    pub async fn dismiss(&self, id: NotificationId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.visible.len();
        state.visible.retain(|n| n.id != id);
        before != state.visible.len()
    }
}

impl Default for MemoryNotifications {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationPlatform for MemoryNotifications {
    fn show(
        &self,
        title: String,
        options: NotificationOptions,
    ) -> BoxFuture<'_, Result<NotificationId>> {
        Box::pin(async move {
            let id = NotificationId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let record = NotificationRecord { id, title, options };

            let mut state = self.state.lock().await;
            if !record.tag().is_empty() {
                let tag = record.tag().to_string();
                state.visible.retain(|n| {
                    let replaced = n.tag() == tag;
                    if replaced {
                        debug!(replaced = %n.id, by = %id, tag = %tag, "Replacing notification with same tag");
                    }
                    !replaced
                });
            }
            state.visible.push(record.clone());
            state.history.push(record.clone());
            drop(state);

            // No subscribers is fine
            let _ = self.displayed_tx.send(record);
            Ok(id)
        })
    }

    fn displayed(&self) -> BoxFuture<'_, Vec<NotificationRecord>> {
        Box::pin(async move { self.visible().await })
    }

    fn close(&self, id: NotificationId) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.dismiss(id).await })
    }
}

/// Open windows held in memory.
#[derive(Debug, Default)]
pub struct MemoryClients {
    next_id: AtomicU64,
    clients: Mutex<BTreeMap<ClientId, ClientInfo>>,
}

impl MemoryClients {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> ClientId {
        ClientId(format!("client-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }

    /// Register a window the user already has open.
    pub async fn add_window(&self, url: Url, controlled: bool) -> ClientInfo {
        let client = ClientInfo {
            id: self.allocate_id(),
            url,
            kind: ClientKind::Window,
            focused: false,
            controlled,
        };
        self.clients.lock().await.insert(client.id.clone(), client.clone());
        client
    }

    pub async fn get(&self, id: &ClientId) -> Option<ClientInfo> {
        self.clients.lock().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<ClientInfo> {
        self.clients.lock().await.values().cloned().collect()
    }
}

impl ClientRegistry for MemoryClients {
    fn match_all(&self, include_uncontrolled: bool) -> BoxFuture<'_, Vec<ClientInfo>> {
        Box::pin(async move {
            self.clients
                .lock()
                .await
                .values()
                .filter(|c| c.kind == ClientKind::Window)
                .filter(|c| include_uncontrolled || c.controlled)
                .cloned()
                .collect()
        })
    }

    fn focus<'a>(&'a self, id: &'a ClientId) -> BoxFuture<'a, Result<ClientInfo>> {
        Box::pin(async move {
            let mut clients = self.clients.lock().await;
            if !clients.contains_key(id) {
                return Err(WorkerError::NotFound(format!("client {}", id)));
            }
            for client in clients.values_mut() {
                client.focused = &client.id == id;
            }
            clients
                .get(id)
                .cloned()
                .ok_or_else(|| WorkerError::NotFound(format!("client {}", id)))
        })
    }

    fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<ClientInfo>> {
        Box::pin(async move {
            let client = ClientInfo {
                id: self.allocate_id(),
                url: url.clone(),
                kind: ClientKind::Window,
                focused: true,
                controlled: true,
            };
            let mut clients = self.clients.lock().await;
            for other in clients.values_mut() {
                other.focused = false;
            }
            clients.insert(client.id.clone(), client.clone());
            Ok(client)
        })
    }

    fn claim(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let mut claimed = 0;
            for client in self.clients.lock().await.values_mut() {
                if !client.controlled {
                    client.controlled = true;
                    claimed += 1;
                }
            }
            claimed
        })
    }
}
