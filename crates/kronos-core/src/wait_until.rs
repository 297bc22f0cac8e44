//! Lifetime extension for work that outlives its event handler.
//!
//! A handler may return before everything it started has finished (the
//! opportunistic cache write after a network hit is the main case). Such
//! work is registered here, and the host awaits [`WaitUntil::settle`] before
//! treating the worker as idle or terminating it.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct WaitUntil {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the worker alive until `work` completes.
    ///
    /// Work that already finished is reaped here, so a worker that is never
    /// settled does not accumulate completed tasks.
    pub async fn extend<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "Extended work did not complete");
            }
        }
        tasks.spawn(work);
    }

    /// Registered work that has not been reaped yet.
    pub async fn pending(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait for every registered task, including ones registered while
    /// waiting. Returns how many tasks completed.
    pub async fn settle(&self) -> usize {
        let mut completed = 0;
        loop {
            let mut batch = std::mem::take(&mut *self.tasks.lock().await);
            if batch.is_empty() {
                if completed > 0 {
                    debug!(completed, "Extended work settled");
                }
                return completed;
            }
            while let Some(result) = batch.join_next().await {
                completed += 1;
                if let Err(e) = result {
                    warn!(error = %e, "Extended work did not complete");
                }
            }
        }
    }
}
