//! Event dispatch for one worker version.
//!
//! The host delivers platform events (install, activate, fetch, push,
//! message, notification click) to a [`ServiceWorker`], one handler per
//! event kind. Each handler's future is the event's completion signal; the
//! host awaits it, and awaits [`ServiceWorker::settle`] for work the
//! handler left running, before considering the worker idle.
//!
//! Process-wide worker state (cache manager, scheduler, pending work) lives
//! in a `WorkerState` built on the first event and torn down by
//! [`ServiceWorker::terminate`].

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{CacheManager, FetchOutcome};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::lifecycle::{ActivationReport, Registration, WorkerPhase, WorkerVersionId};
use crate::models::{NotificationId, NotificationRecord, PushPayload, Request, WorkerCommand};
use crate::platform::{ClientInfo, Platform};
use crate::scheduler::NotificationScheduler;
use crate::wait_until::WaitUntil;

/// An event raised by the platform.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Push(Option<Vec<u8>>),
    Message(Value),
    NotificationClick(NotificationRecord),
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::NotificationClick(_) => "notificationclick",
        }
    }
}

/// What handling an event produced.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Installed(WorkerVersionId),
    Activated(ActivationReport),
    Fetch(FetchOutcome),
    Displayed(NotificationId),
    /// The command that was carried out, `None` for unrelated messages.
    Command(Option<WorkerCommand>),
    Focused(ClientInfo),
}

/// What teardown released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub settled: usize,
    pub aborted_timers: usize,
}

struct WorkerState {
    origin: Url,
    cache: CacheManager,
    scheduler: NotificationScheduler,
    wait_until: WaitUntil,
    version: Mutex<Option<WorkerVersionId>>,
}

impl WorkerState {
    fn init(config: &WorkerConfig, platform: &Platform, registration: &Registration) -> Result<Self> {
        let origin = config.origin_url()?;
        debug!(origin = %origin, cache_version = %config.cache_version, "Initialising worker state");
        Ok(Self {
            cache: CacheManager::new(
                &config.cache_version,
                origin.clone(),
                registration.storage.clone(),
                platform.network.clone(),
            ),
            scheduler: NotificationScheduler::new(
                platform.notifications.clone(),
                config.notifications.clone(),
            ),
            origin,
            wait_until: WaitUntil::new(),
            version: Mutex::new(None),
        })
    }
}

pub struct ServiceWorker {
    config: WorkerConfig,
    platform: Platform,
    registration: Registration,
    state: OnceCell<WorkerState>,
}

impl ServiceWorker {
    pub fn new(config: WorkerConfig, platform: Platform, registration: Registration) -> Self {
        Self {
            config,
            platform,
            registration,
            state: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    async fn state(&self) -> Result<&WorkerState> {
        self.state
            .get_or_try_init(|| async {
                WorkerState::init(&self.config, &self.platform, &self.registration)
            })
            .await
    }

    async fn version(&self) -> Option<WorkerVersionId> {
        match self.state.get() {
            Some(state) => *state.version.lock().await,
            None => None,
        }
    }

    /// Current lifecycle phase, `None` before install or once no longer
    /// tracked (superseded or failed).
    pub async fn phase(&self) -> Option<WorkerPhase> {
        let id = self.version().await?;
        self.registration.lifecycle.lock().await.phase_of(id)
    }

    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
        debug!(event = event.kind(), "Dispatching event");
        match event {
            WorkerEvent::Install => self.on_install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => self.on_activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => self.on_fetch(&request).await.map(EventOutcome::Fetch),
            WorkerEvent::Push(data) => self
                .on_push(data.as_deref())
                .await
                .map(EventOutcome::Displayed),
            WorkerEvent::Message(message) => {
                self.on_message(&message).await.map(EventOutcome::Command)
            }
            WorkerEvent::NotificationClick(record) => self
                .on_notification_click(&record)
                .await
                .map(EventOutcome::Focused),
        }
    }

    /// Install: precache the manifest. The version reaches Waiting only if
    /// every asset was cached.
    #[instrument(skip(self), fields(cache_version = %self.config.cache_version))]
    pub async fn on_install(&self) -> Result<WorkerVersionId> {
        let state = self.state().await?;
        let id = self
            .registration
            .lifecycle
            .lock()
            .await
            .begin_install(&self.config.cache_version, self.config.skip_waiting);
        *state.version.lock().await = Some(id);

        // The lifecycle lock is not held while fetching, so the active
        // version keeps serving requests during the install.
        let precached = state.cache.precache(&self.config.precache).await;

        let mut lifecycle = self.registration.lifecycle.lock().await;
        match precached {
            Ok(count) => {
                let replaced = lifecycle.install_succeeded(id)?;
                info!(worker = %id, assets = count, "Worker installed");
                if let Some(old) = replaced.filter(|old| !lifecycle.owns_cache(&old.cache_version)) {
                    if self.registration.storage.write().await.delete(&old.cache_version) {
                        info!(worker = %old.id, cache = %old.cache_version, "Deleted superseded cache");
                    }
                }
                Ok(id)
            }
            Err(e) => {
                lifecycle.install_failed(id, &e)?;
                Err(e)
            }
        }
    }

    /// Activate: drop stale cache versions, then claim open pages.
    #[instrument(skip(self), fields(cache_version = %self.config.cache_version))]
    pub async fn on_activate(&self) -> Result<ActivationReport> {
        let state = self.state().await?;
        let id = self
            .version()
            .await
            .ok_or_else(|| WorkerError::NotFound("worker has not been installed".to_string()))?;
        self.registration
            .lifecycle
            .lock()
            .await
            .activate(id, &state.cache, self.platform.clients.as_ref())
            .await
    }

    /// Install, then activate if the platform would let the new version
    /// take over now. Returns the activation report when it did.
    pub async fn start(&self) -> Result<Option<ActivationReport>> {
        self.on_install().await?;
        let controlled = self.platform.clients.match_all(false).await.len();
        let ready = self
            .registration
            .lifecycle
            .lock()
            .await
            .ready_to_activate(controlled);
        if ready {
            self.on_activate().await.map(Some)
        } else {
            info!(controlled, "Worker waiting for controlled pages to close");
            Ok(None)
        }
    }

    /// Fetch: network first, cache fallback. Only the active version
    /// intercepts requests.
    pub async fn on_fetch(&self, request: &Request) -> Result<FetchOutcome> {
        let state = self.state().await?;
        let active = match self.version().await {
            Some(id) => self.registration.lifecycle.lock().await.is_active(id),
            None => false,
        };
        if !active {
            return Ok(FetchOutcome::NotIntercepted);
        }
        state.cache.handle(request, &state.wait_until).await
    }

    /// Push: display the payload, falling back to defaults for anything
    /// missing or unparseable.
    pub async fn on_push(&self, data: Option<&[u8]>) -> Result<NotificationId> {
        let state = self.state().await?;
        let payload = PushPayload::parse(data);
        state.scheduler.show_push(payload).await
    }

    /// Message: carry out a page command.
    pub async fn on_message(&self, message: &Value) -> Result<Option<WorkerCommand>> {
        let state = self.state().await?;
        let Some(command) = WorkerCommand::from_message(message).inspect_err(|e| {
            warn!(error = %e, "Rejected page command");
        })?
        else {
            debug!("Ignoring message without a known command type");
            return Ok(None);
        };

        match &command {
            WorkerCommand::ScheduleNotification(schedule) => {
                state.scheduler.schedule(schedule.clone()).await;
            }
            WorkerCommand::CancelNotifications => {
                state.scheduler.cancel_all().await;
            }
        }
        Ok(Some(command))
    }

    /// Notification click: close it and bring the app forward.
    pub async fn on_notification_click(&self, record: &NotificationRecord) -> Result<ClientInfo> {
        let state = self.state().await?;
        state
            .scheduler
            .handle_click(record, self.platform.clients.as_ref(), &state.origin)
            .await
    }

    /// Number of scheduled notifications that have not fired yet.
    pub async fn pending_notifications(&self) -> usize {
        match self.state.get() {
            Some(state) => state.scheduler.pending_count().await,
            None => 0,
        }
    }

    /// Wait for all work handlers left running.
    pub async fn settle(&self) -> usize {
        match self.state.get() {
            Some(state) => state.wait_until.settle().await,
            None => 0,
        }
    }

    /// The host is terminating the worker: finish extended work, then drop
    /// armed timers.
    pub async fn terminate(self) -> TeardownReport {
        let Some(state) = self.state.get() else {
            return TeardownReport {
                settled: 0,
                aborted_timers: 0,
            };
        };
        let settled = state.wait_until.settle().await;
        let aborted_timers = state.scheduler.shutdown().await;
        info!(settled, aborted_timers, "Worker terminated");
        TeardownReport {
            settled,
            aborted_timers,
        }
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("origin", &self.config.origin)
            .field("cache_version", &self.config.cache_version)
            .field("initialised", &self.state.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Response;
    use crate::test_support::TestPlatform;
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;

    const ORIGIN: &str = "https://kronos.example";

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            origin: ORIGIN.to_string(),
            cache_version: version.to_string(),
            ..Default::default()
        }
    }

    fn serve_manifest(test: &TestPlatform) {
        for path in ["/login.html", "/app.html", "/manifest.json"] {
            test.network.respond(url(path).as_str(), Response::new(200, path));
        }
    }

    async fn started_worker(test: &TestPlatform, registration: &Registration) -> ServiceWorker {
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), registration.clone());
        worker.start().await.unwrap();
        worker
    }

    #[tokio::test]
    async fn test_start_installs_and_activates() {
        let test = TestPlatform::new();
        serve_manifest(&test);
        test.clients.add_window(url("/app.html"), false).await;
        let registration = Registration::new();
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), registration.clone());

        assert_eq!(worker.phase().await, None);
        let report = worker.start().await.unwrap().expect("skip_waiting activates");
        assert_eq!(report.claimed_clients, 1);
        assert_eq!(worker.phase().await, Some(WorkerPhase::Active));
        assert_eq!(registration.cache_names().await, vec!["kronos-v1"]);
    }

    #[tokio::test]
    async fn test_failed_precache_blocks_install() {
        let test = TestPlatform::new();
        test.network.respond(url("/login.html").as_str(), Response::new(200, "login"));
        test.network.fail(url("/app.html").as_str());
        let registration = Registration::new();
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), registration.clone());

        let result = worker.dispatch(WorkerEvent::Install).await;
        assert!(matches!(result, Err(WorkerError::Cache(_))));
        assert_eq!(worker.phase().await, None);
        assert!(registration.cache_names().await.is_empty());
        assert!(matches!(
            worker.dispatch(WorkerEvent::Activate).await,
            Err(WorkerError::NotFound(_))
        ));

        // Retrying the whole install succeeds once the asset is reachable.
        serve_manifest(&test);
        worker.dispatch(WorkerEvent::Install).await.unwrap();
        assert_eq!(worker.phase().await, Some(WorkerPhase::Waiting));
    }

    #[tokio::test]
    async fn test_fetch_before_activation_is_not_intercepted() {
        let test = TestPlatform::new();
        serve_manifest(&test);
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), Registration::new());
        worker.on_install().await.unwrap();

        let outcome = worker
            .dispatch(WorkerEvent::Fetch(Request::get(url("/app.html"))))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Fetch(FetchOutcome::NotIntercepted));
    }

    #[tokio::test]
    async fn test_offline_after_visit_serves_cache() {
        let test = TestPlatform::new();
        serve_manifest(&test);
        let registration = Registration::new();
        let worker = started_worker(&test, &registration).await;

        test.network.respond(url("/api/timetable").as_str(), Response::new(200, r#"{"timetables":[]}"#));
        let online = worker.on_fetch(&Request::get(url("/api/timetable"))).await.unwrap();
        worker.settle().await;

        test.network.go_offline();
        let offline = worker.on_fetch(&Request::get(url("/api/timetable"))).await.unwrap();
        let (FetchOutcome::Responded(online), FetchOutcome::Responded(offline)) = (online, offline) else {
            panic!("both fetches should respond");
        };
        assert_eq!(online.body, offline.body);
        assert!(offline.from_cache);

        // precached pages are available without ever being visited
        let login = worker.on_fetch(&Request::get(url("/login.html"))).await.unwrap();
        assert!(matches!(login, FetchOutcome::Responded(r) if r.body == b"/login.html"));

        // never visited and not precached
        assert!(matches!(
            worker.on_fetch(&Request::get(url("/grades.html"))).await,
            Err(WorkerError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_non_get_passes_through() {
        let test = TestPlatform::new();
        serve_manifest(&test);
        let worker = started_worker(&test, &Registration::new()).await;
        let before = test.network.request_count();

        let outcome = worker
            .on_fetch(&Request::new(Method::POST, url("/api/todos")))
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NotIntercepted);
        assert_eq!(test.network.request_count(), before);
    }

    #[tokio::test]
    async fn test_new_version_takes_over() {
        let test = TestPlatform::new();
        serve_manifest(&test);
        let registration = Registration::new();
        let v1 = started_worker(&test, &registration).await;

        let v2 = ServiceWorker::new(config("kronos-v2"), test.platform(), registration.clone());
        v2.on_install().await.unwrap();

        // v1 keeps serving while v2 waits
        assert_eq!(v1.phase().await, Some(WorkerPhase::Active));
        assert!(matches!(
            v1.on_fetch(&Request::get(url("/app.html"))).await.unwrap(),
            FetchOutcome::Responded(_)
        ));

        let report = v2.on_activate().await.unwrap();
        assert_eq!(report.deleted_caches, vec!["kronos-v1"]);
        assert_eq!(v1.phase().await, None);
        assert_eq!(v2.phase().await, Some(WorkerPhase::Active));
        assert_eq!(
            v1.on_fetch(&Request::get(url("/app.html"))).await.unwrap(),
            FetchOutcome::NotIntercepted
        );

        v1.settle().await;
        assert_eq!(registration.cache_names().await, vec!["kronos-v2"]);
    }

    #[tokio::test]
    async fn test_replaced_waiting_version_drops_its_cache() {
        let test = TestPlatform::new();
        serve_manifest(&test);
        let registration = Registration::new();
        let v1 = started_worker(&test, &registration).await;
        let v2 = ServiceWorker::new(config("kronos-v2"), test.platform(), registration.clone());
        v2.on_install().await.unwrap();
        assert_eq!(registration.cache_names().await, vec!["kronos-v1", "kronos-v2"]);

        let v3 = ServiceWorker::new(config("kronos-v3"), test.platform(), registration.clone());
        v3.on_install().await.unwrap();

        assert_eq!(v2.phase().await, None);
        assert_eq!(v3.phase().await, Some(WorkerPhase::Waiting));
        assert_eq!(registration.cache_names().await, vec!["kronos-v1", "kronos-v3"]);
        assert_eq!(v1.phase().await, Some(WorkerPhase::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_message_end_to_end() {
        let test = TestPlatform::new();
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), Registration::new());

        let handled = worker
            .dispatch(WorkerEvent::Message(json!({
                "type": "SCHEDULE_NOTIFICATION",
                "delayMs": 1000,
                "title": "Period ending",
                "body": "Maths ends in 1 min",
                "tag": "period-1"
            })))
            .await
            .unwrap();
        assert!(matches!(
            handled,
            EventOutcome::Command(Some(WorkerCommand::ScheduleNotification(_)))
        ));
        assert_eq!(worker.pending_notifications().await, 1);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(test.notifications.history().await.is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        let shown = test.notifications.visible().await;
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].tag(), "period-1");
        assert_eq!(shown[0].title, "Period ending");
        assert_eq!(shown[0].body(), "Maths ends in 1 min");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_message_leaves_zero_delay_timer_armed() {
        let test = TestPlatform::new();
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), Registration::new());

        worker
            .on_message(&json!({"type": "SCHEDULE_NOTIFICATION", "delayMs": 0, "title": "t", "body": "b", "tag": "x"}))
            .await
            .unwrap();
        worker
            .on_message(&json!({"type": "CANCEL_NOTIFICATIONS"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            test.notifications.visible().await.len(),
            1,
            "cancel only dismisses displayed notifications; the armed timer still fires"
        );
    }

    #[tokio::test]
    async fn test_bad_command_is_rejected_and_worker_survives() {
        let test = TestPlatform::new();
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), Registration::new());

        let result = worker
            .on_message(&json!({"type": "SCHEDULE_NOTIFICATION", "title": "no delay"}))
            .await;
        assert!(matches!(result, Err(WorkerError::Validation(_))));
        assert_eq!(worker.on_message(&json!({"type": "HELLO"})).await.unwrap(), None);

        worker
            .on_message(&json!({"type": "SCHEDULE_NOTIFICATION", "delayMs": 5, "title": "ok", "body": "", "tag": "t"}))
            .await
            .unwrap();
        assert_eq!(worker.pending_notifications().await, 1);
    }

    #[tokio::test]
    async fn test_push_and_click() {
        let test = TestPlatform::new();
        let worker = ServiceWorker::new(config("kronos-v1"), test.platform(), Registration::new());

        let outcome = worker
            .dispatch(WorkerEvent::Push(Some(b"{not json".to_vec())))
            .await
            .unwrap();
        let EventOutcome::Displayed(id) = outcome else {
            panic!("expected a displayed notification");
        };
        let record = test.notifications.visible().await.remove(0);
        assert_eq!(record.id, id);
        assert_eq!(record.title, "Kronos");

        let outcome = worker
            .dispatch(WorkerEvent::NotificationClick(record))
            .await
            .unwrap();
        let EventOutcome::Focused(client) = outcome else {
            panic!("expected a focused client");
        };
        assert_eq!(client.url, url("/app.html"));
        assert!(test.notifications.visible().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_settles_then_drops_timers() {
        let test = TestPlatform::new();
        serve_manifest(&test);
        let worker = started_worker(&test, &Registration::new()).await;

        worker.on_fetch(&Request::get(url("/app.html"))).await.unwrap();
        worker
            .on_message(&json!({"type": "SCHEDULE_NOTIFICATION", "delayMs": 60000, "title": "t", "body": "b", "tag": "x"}))
            .await
            .unwrap();

        let report = worker.terminate().await;
        assert_eq!(report.settled, 1);
        assert_eq!(report.aborted_timers, 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(test.notifications.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_origin_fails_every_event() {
        let test = TestPlatform::new();
        let mut bad = config("kronos-v1");
        bad.origin = "not a url".to_string();
        let worker = ServiceWorker::new(bad, test.platform(), Registration::new());
        assert!(matches!(
            worker.on_push(None).await,
            Err(WorkerError::Validation(_))
        ));
    }
}
