//! Host platform seams.
//!
//! The worker never talks to a browser directly. Everything the platform
//! provides (the network stack, the notification tray, open windows) is
//! reached through these traits, so a host can back them with a real
//! browser bridge, a plain HTTP client, or the in-memory implementations
//! used by the tests and the command-line host.

pub mod http;
pub mod memory;

use std::sync::Arc;

use futures::future::BoxFuture;
use url::Url;

use crate::error::Result;
use crate::models::{NotificationId, NotificationOptions, NotificationRecord, Request, Response};

pub use http::HttpNetwork;
pub use memory::{MemoryClients, MemoryNotifications};

/// The network stack underneath the worker.
pub trait Network: Send + Sync {
    /// Fetch a request. Resolves with any HTTP response, including error
    /// statuses; fails only when no response was obtained.
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// The platform's notification tray.
pub trait NotificationPlatform: Send + Sync {
    /// Display a notification. A visible notification with the same tag is
    /// replaced.
    fn show(&self, title: String, options: NotificationOptions)
        -> BoxFuture<'_, Result<NotificationId>>;

    /// Notifications currently displayed for this app.
    fn displayed(&self) -> BoxFuture<'_, Vec<NotificationRecord>>;

    /// Dismiss a notification. Returns false if it was no longer displayed.
    fn close(&self, id: NotificationId) -> BoxFuture<'_, bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub String);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Window,
    Worker,
}

/// A page or worker within the worker's origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub url: Url,
    pub kind: ClientKind,
    pub focused: bool,
    /// Whether this worker controls the client's fetches.
    pub controlled: bool,
}

/// Open clients of the origin.
pub trait ClientRegistry: Send + Sync {
    fn match_all(&self, include_uncontrolled: bool) -> BoxFuture<'_, Vec<ClientInfo>>;

    fn focus<'a>(&'a self, id: &'a ClientId) -> BoxFuture<'a, Result<ClientInfo>>;

    fn open_window<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<ClientInfo>>;

    /// Take control of every uncontrolled client. Returns how many were
    /// newly claimed.
    fn claim(&self) -> BoxFuture<'_, usize>;
}

/// The set of platform services handed to a worker.
#[derive(Clone)]
pub struct Platform {
    pub network: Arc<dyn Network>,
    pub notifications: Arc<dyn NotificationPlatform>,
    pub clients: Arc<dyn ClientRegistry>,
}

impl Platform {
    pub fn new(
        network: Arc<dyn Network>,
        notifications: Arc<dyn NotificationPlatform>,
        clients: Arc<dyn ClientRegistry>,
    ) -> Self {
        Self {
            network,
            notifications,
            clients,
        }
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
