use serde::{Deserialize, Serialize};

/// Platform-assigned identifier of a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub u64);

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything needed to display a notification, besides its title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Notifications sharing a tag replace one another on display.
    pub tag: String,
    /// Page to open when the notification is clicked.
    pub url: Option<String>,
    pub vibrate: Vec<u32>,
}

/// A notification currently displayed by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub title: String,
    pub options: NotificationOptions,
}

impl NotificationRecord {
    pub fn tag(&self) -> &str {
        &self.options.tag
    }

    pub fn body(&self) -> &str {
        &self.options.body
    }
}
