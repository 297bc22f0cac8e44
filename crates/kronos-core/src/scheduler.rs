//! Local notification scheduling.
//!
//! The page asks the worker to show a notification after a delay (period
//! end warnings) without any server involvement. Each request arms its own
//! timer; timers are tracked by tag until they fire.
//!
//! `cancel_all` only dismisses notifications that are already displayed.
//! Timers that have not fired yet keep running and will still display.
//! Pending timers are dropped only when the worker itself shuts down.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationConfig;
use crate::error::{Result, WorkerError};
use crate::models::{
    NotificationId, NotificationOptions, NotificationRecord, PushPayload, ScheduleNotification,
};
use crate::platform::{ClientInfo, ClientRegistry, NotificationPlatform};

/// An armed timer that has not fired yet.
#[derive(Debug)]
struct PendingNotification {
    id: u64,
    title: String,
    delay: Duration,
    armed_at: Instant,
    handle: JoinHandle<()>,
}

type PendingByTag = BTreeMap<String, Vec<PendingNotification>>;

/// Summary of a pending timer, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub tag: String,
    pub title: String,
    /// Time left until the timer fires, zero if overdue.
    pub remaining: Duration,
}

pub struct NotificationScheduler {
    notifications: Arc<dyn NotificationPlatform>,
    settings: NotificationConfig,
    pending: Arc<Mutex<PendingByTag>>,
    next_id: AtomicU64,
}

impl NotificationScheduler {
    pub fn new(notifications: Arc<dyn NotificationPlatform>, settings: NotificationConfig) -> Self {
        Self {
            notifications,
            settings,
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn options(&self, body: String, tag: String, url: Option<String>, icon: Option<String>) -> NotificationOptions {
        let icon = icon.unwrap_or_else(|| self.settings.icon_url.clone());
        NotificationOptions {
            body,
            badge: icon.clone(),
            icon,
            tag,
            url,
            vibrate: self.settings.vibrate.clone(),
        }
    }

    /// Arm a timer that displays a notification after `delay_ms`.
    ///
    /// Fire-and-forget: display failures are logged, never retried or
    /// reported back. Timers sharing a tag are not deduplicated.
    pub async fn schedule(&self, command: ScheduleNotification) {
        let ScheduleNotification {
            delay_ms,
            title,
            body,
            tag,
        } = command;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = Duration::from_millis(delay_ms);
        let options = self.options(body, tag.clone(), None, None);

        // Hold the map while spawning so a zero-delay timer cannot try to
        // unregister itself before it is registered.
        let mut pending = self.pending.lock().await;

        let notifications = self.notifications.clone();
        let registry = self.pending.clone();
        let fire_title = title.clone();
        let fire_tag = tag.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::unregister(&registry, &fire_tag, id).await;
            match notifications.show(fire_title, options).await {
                Ok(shown) => info!(tag = %fire_tag, notification = %shown, "Scheduled notification displayed"),
                Err(e) => warn!(tag = %fire_tag, error = %e, "Failed to display scheduled notification"),
            }
        });

        pending.entry(tag.clone()).or_default().push(PendingNotification {
            id,
            title,
            delay,
            armed_at: Instant::now(),
            handle,
        });
        debug!(tag = %tag, delay_ms, "Notification scheduled");
    }

    async fn unregister(registry: &Mutex<PendingByTag>, tag: &str, id: u64) {
        let mut pending = registry.lock().await;
        if let Some(timers) = pending.get_mut(tag) {
            timers.retain(|t| t.id != id);
            if timers.is_empty() {
                pending.remove(tag);
            }
        }
    }

    /// Dismiss every displayed notification. Returns how many were closed.
    ///
    /// Armed timers are left alone and will still fire.
    pub async fn cancel_all(&self) -> usize {
        let displayed = self.notifications.displayed().await;
        let mut closed = 0;
        for record in displayed {
            if self.notifications.close(record.id).await {
                closed += 1;
            }
        }
        let still_pending = self.pending_count().await;
        info!(closed, still_pending, "Cancelled displayed notifications");
        closed
    }

    /// Display a notification for a push message, filling in defaults.
    pub async fn show_push(&self, payload: PushPayload) -> Result<NotificationId> {
        let title = payload
            .title
            .unwrap_or_else(|| self.settings.default_title.clone());
        let tag = payload
            .tag
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.settings.default_tag.clone());
        let url = payload.url.filter(|u| !u.is_empty());
        let options = self.options(payload.body.unwrap_or_default(), tag, url, payload.icon);
        self.notifications.show(title, options).await
    }

    /// React to a notification click: close it, then focus an open app
    /// window or open a new one at the notification's URL.
    pub async fn handle_click(
        &self,
        record: &NotificationRecord,
        clients: &dyn ClientRegistry,
        origin: &Url,
    ) -> Result<ClientInfo> {
        self.notifications.close(record.id).await;

        let windows = clients.match_all(true).await;
        if let Some(existing) = windows
            .iter()
            .find(|c| c.url.as_str().contains(&self.settings.app_window_match))
        {
            debug!(client = %existing.id, "Focusing existing app window");
            return clients.focus(&existing.id).await;
        }

        let target = record
            .options
            .url
            .as_deref()
            .unwrap_or(&self.settings.app_url);
        let url = origin.join(target).map_err(|e| {
            WorkerError::Validation(format!("bad notification url {}: {}", target, e))
        })?;
        debug!(url = %url, "Opening app window");
        clients.open_window(&url).await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.values().map(Vec::len).sum()
    }

    pub async fn pending(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        self.pending
            .lock()
            .await
            .iter()
            .flat_map(|(tag, timers)| {
                timers.iter().map(move |t| PendingSummary {
                    tag: tag.clone(),
                    title: t.title.clone(),
                    remaining: (t.armed_at + t.delay).saturating_duration_since(now),
                })
            })
            .collect()
    }

    /// Abort every armed timer. Used when the host terminates the worker.
    pub async fn shutdown(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let mut aborted = 0;
        for timer in pending.values().flatten() {
            timer.handle.abort();
            aborted += 1;
        }
        pending.clear();
        if aborted > 0 {
            warn!(aborted, "Worker shutting down with notifications still pending");
        }
        aborted
    }
}

impl std::fmt::Debug for NotificationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationScheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MemoryClients, MemoryNotifications};

    fn scheduler() -> (NotificationScheduler, Arc<MemoryNotifications>) {
        let tray = Arc::new(MemoryNotifications::new());
        (
            NotificationScheduler::new(tray.clone(), NotificationConfig::default()),
            tray,
        )
    }

    fn command(delay_ms: u64, title: &str, body: &str, tag: &str) -> ScheduleNotification {
        ScheduleNotification {
            delay_ms,
            title: title.to_string(),
            body: body.to_string(),
            tag: tag.to_string(),
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        // Let woken timer tasks finish displaying.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_end_warning_fires_after_delay() {
        let (scheduler, tray) = scheduler();
        scheduler
            .schedule(command(1000, "Period ending", "Maths ends in 1 min", "period-1"))
            .await;

        advance(999).await;
        assert!(tray.history().await.is_empty(), "must not fire before 1000ms");
        assert_eq!(scheduler.pending_count().await, 1);

        advance(1).await;
        let shown = tray.history().await;
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Period ending");
        assert_eq!(shown[0].body(), "Maths ends in 1 min");
        assert_eq!(shown[0].tag(), "period-1");
        assert_eq!(shown[0].options.vibrate, vec![200, 100, 200]);
        assert_eq!(shown[0].options.icon, shown[0].options.badge);
        assert_eq!(scheduler.pending_count().await, 0);

        advance(5000).await;
        assert_eq!(tray.history().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_stop_pending_timer() {
        let (scheduler, tray) = scheduler();
        scheduler.schedule(command(0, "Now", "zero delay", "z")).await;

        // Nothing is displayed yet, so there is nothing to dismiss...
        assert_eq!(scheduler.cancel_all().await, 0);

        // ...and the armed timer still fires.
        advance(1).await;
        let visible = tray.visible().await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].title, "Now");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_dismisses_displayed_only() {
        let (scheduler, tray) = scheduler();
        scheduler.schedule(command(10, "a", "", "a")).await;
        scheduler.schedule(command(20, "b", "", "b")).await;
        scheduler.schedule(command(500, "c", "", "c")).await;

        advance(30).await;
        assert_eq!(tray.visible().await.len(), 2);
        assert_eq!(scheduler.cancel_all().await, 2);
        assert!(tray.visible().await.is_empty());
        assert_eq!(scheduler.pending_count().await, 1);

        advance(500).await;
        let visible = tray.visible().await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].title, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_tag_overlapping_leaves_second() {
        let (scheduler, tray) = scheduler();
        scheduler.schedule(command(100, "First", "one", "period-2")).await;
        scheduler.schedule(command(200, "Second", "two", "period-2")).await;
        assert_eq!(scheduler.pending_count().await, 2);

        advance(250).await;
        let visible = tray.visible().await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].title, "Second");
        assert_eq!(visible[0].body(), "two");
        assert_eq!(tray.history().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_tag_dismissed_between_fires_shows_both() {
        let (scheduler, tray) = scheduler();
        scheduler.schedule(command(100, "First", "one", "period-3")).await;
        scheduler.schedule(command(300, "Second", "two", "period-3")).await;

        advance(150).await;
        let first = tray.visible().await;
        assert_eq!(first.len(), 1);
        assert!(tray.dismiss(first[0].id).await);

        advance(200).await;
        let history = tray.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].title, "First");
        assert_eq!(history[1].title, "Second");
        assert_eq!(tray.visible().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_summary_and_shutdown() {
        let (scheduler, tray) = scheduler();
        scheduler.schedule(command(1000, "Later", "", "later")).await;
        advance(400).await;

        let pending = scheduler.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tag, "later");
        assert!(pending[0].remaining <= Duration::from_millis(600));
        assert!(pending[0].remaining >= Duration::from_millis(599));

        assert_eq!(scheduler.shutdown().await, 1);
        advance(2000).await;
        assert!(tray.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_push_defaults() {
        let (scheduler, tray) = scheduler();
        scheduler.show_push(PushPayload::default()).await.unwrap();
        scheduler
            .show_push(PushPayload {
                title: Some("Todo due".into()),
                icon: Some("/icon.png".into()),
                url: Some("/app.html#todos".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let history = tray.history().await;
        assert_eq!(history[0].title, "Kronos");
        assert_eq!(history[0].tag(), "kronos");
        assert_eq!(history[0].body(), "");
        assert_eq!(history[0].options.url, None);
        assert_eq!(history[1].options.icon, "/icon.png");
        assert_eq!(history[1].options.badge, "/icon.png");
        assert_eq!(history[1].options.url.as_deref(), Some("/app.html#todos"));
        // both default to the "kronos" tag, so the second replaced the first
        assert_eq!(tray.visible().await.len(), 1);
    }

    #[tokio::test]
    async fn test_click_focuses_existing_app_window() {
        let (scheduler, tray) = scheduler();
        let clients = MemoryClients::new();
        let origin = Url::parse("https://kronos.example").unwrap();
        clients.add_window(origin.join("/login.html").unwrap(), true).await;
        let app = clients.add_window(origin.join("/app.html").unwrap(), true).await;

        scheduler.show_push(PushPayload::default()).await.unwrap();
        let record = tray.visible().await.remove(0);

        let focused = scheduler.handle_click(&record, &clients, &origin).await.unwrap();
        assert_eq!(focused.id, app.id);
        assert!(focused.focused);
        assert!(tray.visible().await.is_empty());
        assert_eq!(clients.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_click_opens_window_at_notification_url() {
        let (scheduler, tray) = scheduler();
        let clients = MemoryClients::new();
        let origin = Url::parse("https://kronos.example").unwrap();
        clients.add_window(origin.join("/login.html").unwrap(), true).await;

        scheduler
            .show_push(PushPayload {
                url: Some("/grades.html".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let record = tray.visible().await.remove(0);

        let opened = scheduler.handle_click(&record, &clients, &origin).await.unwrap();
        assert_eq!(opened.url.as_str(), "https://kronos.example/grades.html");
        assert!(opened.focused);
    }

    #[tokio::test]
    async fn test_click_without_url_opens_app() {
        let (scheduler, tray) = scheduler();
        let clients = MemoryClients::new();
        let origin = Url::parse("https://kronos.example").unwrap();

        scheduler.show_push(PushPayload::default()).await.unwrap();
        let record = tray.visible().await.remove(0);

        let opened = scheduler.handle_click(&record, &clients, &origin).await.unwrap();
        assert_eq!(opened.url.as_str(), "https://kronos.example/app.html");
    }

    #[tokio::test]
    async fn test_click_with_empty_url_opens_app() {
        let (scheduler, tray) = scheduler();
        let clients = MemoryClients::new();
        let origin = Url::parse("https://kronos.example").unwrap();

        scheduler
            .show_push(PushPayload {
                url: Some(String::new()),
                ..Default::default()
            })
            .await
            .unwrap();
        let record = tray.visible().await.remove(0);
        assert_eq!(record.options.url, None);

        let opened = scheduler.handle_click(&record, &clients, &origin).await.unwrap();
        assert_eq!(opened.url.as_str(), "https://kronos.example/app.html");
    }
}
