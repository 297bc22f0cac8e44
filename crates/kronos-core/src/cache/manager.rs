use std::sync::Arc;

use futures::stream::{self, StreamExt};
use reqwest::Method;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use crate::error::{Result, WorkerError};
use crate::models::{Request, Response, ResponseSnapshot};
use crate::platform::Network;
use crate::wait_until::WaitUntil;

/// Maximum concurrent fetches while precaching.
const MAX_CONCURRENT_PRECACHE: usize = 4;

/// What the fetch handler did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not a same-origin GET; the host lets it through untouched.
    NotIntercepted,
    /// Answered from the network, or from the cache after a network failure
    /// (see `Response::from_cache`).
    Responded(Response),
}

/// Versioned cache with a network-first read policy.
///
/// Several managers (one per worker version) may share the same storage;
/// each only reads and writes its own version.
#[derive(Clone)]
pub struct CacheManager {
    version: String,
    origin: Url,
    storage: Arc<RwLock<CacheStorage>>,
    network: Arc<dyn Network>,
}

impl CacheManager {
    pub fn new(
        version: &str,
        origin: Url,
        storage: Arc<RwLock<CacheStorage>>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            version: version.to_string(),
            origin,
            storage,
            network,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn storage(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.storage
    }

    /// Ensure this version's cache exists.
    pub async fn open(&self) {
        self.storage.write().await.open(&self.version);
    }

    /// Fetch and store every manifest entry, all or nothing.
    ///
    /// Entries are staged and committed in one write only when every fetch
    /// produced an OK response. Returns the number of committed entries.
    pub async fn precache(&self, manifest: &[String]) -> Result<usize> {
        let results: Vec<(String, Result<(String, ResponseSnapshot)>)> = stream::iter(manifest)
            .map(|path| async move { (path.clone(), self.fetch_for_precache(path).await) })
            .buffered(MAX_CONCURRENT_PRECACHE)
            .collect()
            .await;

        let mut staged = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (path, result) in results {
            match result {
                Ok(entry) => staged.push(entry),
                Err(e) => failures.push(format!("{} ({})", path, e)),
            }
        }

        if !failures.is_empty() {
            warn!(
                version = %self.version,
                failed = failures.len(),
                total = manifest.len(),
                "Precache failed, nothing committed"
            );
            return Err(WorkerError::Cache(format!(
                "failed to precache {} of {} assets: {}",
                failures.len(),
                manifest.len(),
                failures.join("; ")
            )));
        }

        let count = staged.len();
        self.storage.write().await.open(&self.version).put_all(staged);
        info!(version = %self.version, count, "Precache committed");
        Ok(count)
    }

    async fn fetch_for_precache(&self, path: &str) -> Result<(String, ResponseSnapshot)> {
        let url = self
            .origin
            .join(path)
            .map_err(|e| WorkerError::Cache(format!("invalid asset path: {}", e)))?;
        let request = Request::get(url);
        let response = self
            .network
            .fetch(&request)
            .await
            .map_err(|e| WorkerError::Cache(e.to_string()))?;
        if !response.is_ok() {
            return Err(WorkerError::Cache(format!(
                "status {} {}",
                response.status, response.status_text
            )));
        }
        Ok((request.cache_key(), ResponseSnapshot::capture(&response)))
    }

    /// Only same-origin GET requests are intercepted.
    pub fn intercepts(&self, request: &Request) -> bool {
        request.method == Method::GET && request.is_same_origin(&self.origin)
    }

    /// Network-first fetch.
    ///
    /// A network response is returned immediately while a copy is stored
    /// in the background under `wait_until`. On network failure the cached
    /// entry for the key is returned, if any.
    pub async fn handle(&self, request: &Request, wait_until: &WaitUntil) -> Result<FetchOutcome> {
        if !self.intercepts(request) {
            return Ok(FetchOutcome::NotIntercepted);
        }

        let key = request.cache_key();
        match self.network.fetch(request).await {
            Ok(response) => {
                let snapshot = ResponseSnapshot::capture(&response);
                let storage = self.storage.clone();
                let version = self.version.clone();
                wait_until
                    .extend(async move {
                        // A version deleted by a newer worker's activation
                        // stays deleted.
                        match storage.write().await.get_mut(&version) {
                            Some(cache) => {
                                debug!(key = %key, version = %version, "Updating cache from network");
                                cache.put(key, snapshot);
                            }
                            None => debug!(key = %key, version = %version, "Cache version gone, dropping update"),
                        }
                    })
                    .await;
                Ok(FetchOutcome::Responded(response))
            }
            Err(network_err) => match self.lookup_key(&key).await {
                Some(cached) => {
                    debug!(key = %key, error = %network_err, "Network failed, serving from cache");
                    Ok(FetchOutcome::Responded(cached))
                }
                None => {
                    debug!(key = %key, error = %network_err, "Network failed, nothing cached");
                    Err(network_err)
                }
            },
        }
    }

    /// The cached response for a request in this version, if any.
    pub async fn lookup(&self, request: &Request) -> Option<Response> {
        self.lookup_key(&request.cache_key()).await
    }

    async fn lookup_key(&self, key: &str) -> Option<Response> {
        let storage = self.storage.read().await;
        storage
            .get(&self.version)
            .and_then(|cache| cache.match_key(key))
            .map(ResponseSnapshot::to_response)
    }

    /// Delete every cache version except this one. Returns the deleted names.
    pub async fn activate_cleanup(&self) -> Vec<String> {
        let mut storage = self.storage.write().await;
        let stale: Vec<String> = storage
            .keys()
            .into_iter()
            .filter(|name| *name != self.version)
            .collect();
        for name in &stale {
            storage.delete(name);
        }
        if !stale.is_empty() {
            info!(version = %self.version, deleted = ?stale, "Deleted stale cache versions");
        }
        stale
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("version", &self.version)
            .field("origin", &self.origin.as_str())
            .finish_non_exhaustive()
    }
}
