//! Worker version lifecycle.
//!
//! ```text
//! Installing ──precache ok──▶ Waiting ──activate──▶ Active ──newer activates──▶ Superseded
//!     │
//!     └──precache failed──▶ Failed
//! ```
//!
//! One [`Registration`] is shared by every worker version deployed for the
//! origin: it owns the cache storage and the controller that decides which
//! version is active.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::cache::{CacheManager, CacheStorage};
use crate::error::{Result, WorkerError};
use crate::platform::ClientRegistry;

/// Buffer size for the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerVersionId(u64);

impl WorkerVersionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WorkerVersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    /// Precaching the manifest.
    Installing,
    /// Installed, not yet controlling pages.
    Waiting,
    /// Controlling pages and serving fetches.
    Active,
    /// Replaced by a newer active version.
    Superseded,
    /// Install failed; never served traffic.
    Failed,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerPhase::Installing => "installing",
            WorkerPhase::Waiting => "waiting",
            WorkerPhase::Active => "active",
            WorkerPhase::Superseded => "superseded",
            WorkerPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One deployed worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerVersion {
    pub id: WorkerVersionId,
    pub cache_version: String,
    pub phase: WorkerPhase,
    /// Activate as soon as installed instead of waiting for pages to close.
    pub skip_waiting: bool,
    pub phase_changed_at: DateTime<Utc>,
}

impl WorkerVersion {
    fn new(cache_version: &str, skip_waiting: bool) -> Self {
        Self {
            id: WorkerVersionId::next(),
            cache_version: cache_version.to_string(),
            phase: WorkerPhase::Installing,
            skip_waiting,
            phase_changed_at: Utc::now(),
        }
    }

    fn set_phase(&mut self, phase: WorkerPhase) -> WorkerPhase {
        let previous = self.phase;
        self.phase = phase;
        self.phase_changed_at = Utc::now();
        previous
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PhaseChange {
        worker: WorkerVersionId,
        cache_version: String,
        from: WorkerPhase,
        to: WorkerPhase,
    },
    /// Open pages were claimed by a newly active worker.
    ControllerChange {
        worker: WorkerVersionId,
        claimed: usize,
    },
}

/// Outcome of an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub worker: WorkerVersionId,
    pub superseded: Option<WorkerVersionId>,
    pub deleted_caches: Vec<String>,
    pub claimed_clients: usize,
}

/// Tracks the installing, waiting, and active versions of the worker.
#[derive(Debug)]
pub struct LifecycleController {
    installing: Option<WorkerVersion>,
    waiting: Option<WorkerVersion>,
    active: Option<WorkerVersion>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            installing: None,
            waiting: None,
            active: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn installing(&self) -> Option<&WorkerVersion> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&WorkerVersion> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&WorkerVersion> {
        self.active.as_ref()
    }

    pub fn is_active(&self, id: WorkerVersionId) -> bool {
        self.active.as_ref().is_some_and(|w| w.id == id)
    }

    /// Phase of a version still tracked by the controller.
    pub fn phase_of(&self, id: WorkerVersionId) -> Option<WorkerPhase> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
            .map(|w| w.phase)
    }

    fn transition(&self, worker: &mut WorkerVersion, to: WorkerPhase) {
        let from = worker.set_phase(to);
        info!(worker = %worker.id, cache_version = %worker.cache_version, %from, %to, "Worker phase change");
        // No subscribers is fine
        let _ = self.events.send(LifecycleEvent::PhaseChange {
            worker: worker.id,
            cache_version: worker.cache_version.clone(),
            from,
            to,
        });
    }

    /// Start installing a new version. An install already in progress is
    /// abandoned.
    pub fn begin_install(&mut self, cache_version: &str, skip_waiting: bool) -> WorkerVersionId {
        if let Some(mut abandoned) = self.installing.take() {
            warn!(worker = %abandoned.id, "Abandoning in-progress install");
            self.transition(&mut abandoned, WorkerPhase::Failed);
        }
        let worker = WorkerVersion::new(cache_version, skip_waiting);
        let id = worker.id;
        info!(worker = %id, cache_version, "Worker installing");
        self.installing = Some(worker);
        id
    }

    fn take_installing(&mut self, id: WorkerVersionId) -> Result<WorkerVersion> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Ok(worker),
            other => {
                self.installing = other;
                Err(WorkerError::NotFound(format!("{} is not installing", id)))
            }
        }
    }

    /// Precache succeeded: Installing -> Waiting. A previously waiting
    /// version is replaced and returned as Superseded.
    pub fn install_succeeded(&mut self, id: WorkerVersionId) -> Result<Option<WorkerVersion>> {
        let mut worker = self.take_installing(id)?;
        let replaced = self.waiting.take().map(|mut replaced| {
            self.transition(&mut replaced, WorkerPhase::Superseded);
            replaced
        });
        self.transition(&mut worker, WorkerPhase::Waiting);
        self.waiting = Some(worker);
        Ok(replaced)
    }

    /// Whether any version still installing, waiting or active owns `cache_version`.
    pub fn owns_cache(&self, cache_version: &str) -> bool {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .any(|worker| worker.cache_version == cache_version)
    }

    /// Precache failed: the version is discarded and the active version
    /// (if any) stays in control.
    pub fn install_failed(&mut self, id: WorkerVersionId, reason: &WorkerError) -> Result<()> {
        let mut worker = self.take_installing(id)?;
        warn!(worker = %id, error = %reason, "Install failed, keeping current worker");
        self.transition(&mut worker, WorkerPhase::Failed);
        Ok(())
    }

    /// Whether the waiting version may take over now, given how many pages
    /// the current active version still controls.
    pub fn ready_to_activate(&self, controlled_clients: usize) -> bool {
        match &self.waiting {
            Some(worker) => worker.skip_waiting || self.active.is_none() || controlled_clients == 0,
            None => false,
        }
    }

    /// Waiting -> Active.
    ///
    /// Deletes every cache version except the new one, then claims all open
    /// clients. The previously active version becomes Superseded.
    pub async fn activate(
        &mut self,
        id: WorkerVersionId,
        cache: &CacheManager,
        clients: &dyn ClientRegistry,
    ) -> Result<ActivationReport> {
        let mut worker = match self.waiting.take() {
            Some(worker) if worker.id == id => worker,
            other => {
                self.waiting = other;
                return Err(WorkerError::NotFound(format!("{} is not waiting", id)));
            }
        };
        if worker.cache_version != cache.version() {
            let message = format!(
                "{} owns cache {} but was given {}",
                id,
                worker.cache_version,
                cache.version()
            );
            self.waiting = Some(worker);
            return Err(WorkerError::Validation(message));
        }

        let superseded = match self.active.take() {
            Some(mut old) => {
                self.transition(&mut old, WorkerPhase::Superseded);
                Some(old.id)
            }
            None => None,
        };
        self.transition(&mut worker, WorkerPhase::Active);
        self.active = Some(worker);

        let deleted_caches = cache.activate_cleanup().await;
        let claimed_clients = clients.claim().await;
        info!(worker = %id, claimed = claimed_clients, "Worker claimed clients");
        let _ = self.events.send(LifecycleEvent::ControllerChange {
            worker: id,
            claimed: claimed_clients,
        });

        Ok(ActivationReport {
            worker: id,
            superseded,
            deleted_caches,
            claimed_clients,
        })
    }
}

/// State shared by every worker version of one origin.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub lifecycle: Arc<Mutex<LifecycleController>>,
    pub storage: Arc<RwLock<CacheStorage>>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.lock().await.subscribe()
    }

    pub async fn cache_names(&self) -> Vec<String> {
        self.storage.read().await.keys()
    }
}
