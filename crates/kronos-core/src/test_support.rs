//! Shared fakes for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::api::{RowFilter, RowStore};
use crate::error::{Result, WorkerError};
use crate::models::{Request, Response};
use crate::platform::{MemoryClients, MemoryNotifications, Network, Platform};

#[derive(Debug, Clone)]
enum Route {
    Respond(Response),
    Fail,
}

/// Scriptable network. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    requests: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.routes.lock().unwrap().insert(url.to_string(), Route::Respond(response));
    }

    pub fn fail(&self, url: &str) {
        self.routes.lock().unwrap().insert(url.to_string(), Route::Fail);
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Network for FakeNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(WorkerError::Network("offline".to_string()));
            }
            let route = self.routes.lock().unwrap().get(&request.cache_key()).cloned();
            match route {
                Some(Route::Respond(response)) => Ok(response),
                Some(Route::Fail) => Err(WorkerError::Network(format!(
                    "connection refused: {}",
                    request.url
                ))),
                None => Ok(Response::new(404, "")),
            }
        })
    }
}

pub struct TestPlatform {
    pub network: Arc<FakeNetwork>,
    pub notifications: Arc<MemoryNotifications>,
    pub clients: Arc<MemoryClients>,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            network: Arc::new(FakeNetwork::new()),
            notifications: Arc::new(MemoryNotifications::new()),
            clients: Arc::new(MemoryClients::new()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform::new(
            self.network.clone(),
            self.notifications.clone(),
            self.clients.clone(),
        )
    }
}

/// In-memory row store. Tokens map to user ids; inserted rows get an `id`
/// and a `created_at` one minute after the previous insert.
///
/// Like a provider with row-level security, row operations are refused
/// unless the store was bound to a caller with `for_token`.
#[derive(Debug, Default)]
struct RowData {
    tokens: Mutex<HashMap<String, String>>,
    tables: Mutex<BTreeMap<String, Vec<Value>>>,
    next_id: AtomicI64,
    fail: AtomicBool,
    bearers: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRowStore {
    data: Arc<RowData>,
    bearer: Option<String>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, token: &str, user_id: &str) {
        self.data.tokens.lock().unwrap().insert(token.to_string(), user_id.to_string());
    }

    /// Make every row operation fail with an upstream error.
    pub fn break_store(&self) {
        self.data.fail.store(true, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.data.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
    }

    /// Bearer tokens row operations were made with, in call order.
    pub fn bearers(&self) -> Vec<String> {
        self.data.bearers.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        let Some(bearer) = &self.bearer else {
            return Err(WorkerError::Auth("row access as the anonymous role".to_string()));
        };
        self.data.bearers.lock().unwrap().push(bearer.clone());
        if self.data.fail.load(Ordering::SeqCst) {
            Err(WorkerError::Upstream("Status 500: database unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn sort(rows: &mut [Value], filter: &RowFilter) {
        let Some((column, ascending)) = &filter.order else {
            return;
        };
        rows.sort_by(|a, b| {
            let a = a.get(column).map(Value::to_string).unwrap_or_default();
            let b = b.get(column).map(Value::to_string).unwrap_or_default();
            if *ascending { a.cmp(&b) } else { b.cmp(&a) }
        });
    }
}

impl RowStore for MemoryRowStore {
    fn verify_token<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.data.tokens.lock().unwrap().get(token).cloned()) })
    }

    fn for_token(&self, token: &str) -> Arc<dyn RowStore> {
        Arc::new(Self {
            data: self.data.clone(),
            bearer: Some(token.to_string()),
        })
    }

    fn read_rows<'a>(&'a self, table: &'a str, filter: &'a RowFilter) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            self.check()?;
            let mut rows: Vec<Value> =
                self.rows(table).into_iter().filter(|row| filter.matches(row)).collect();
            Self::sort(&mut rows, filter);
            Ok(rows)
        })
    }

    fn upsert_row<'a>(
        &'a self,
        table: &'a str,
        row: Value,
        conflict_keys: &'a [&'a str],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check()?;
            let mut tables = self.data.tables.lock().unwrap();
            let rows = tables.entry(table.to_string()).or_default();
            let position = rows
                .iter()
                .position(|r| conflict_keys.iter().all(|k| r.get(*k) == row.get(*k)));
            match position {
                Some(i) => {
                    if let (Value::Object(stored), Value::Object(patch)) = (&mut rows[i], row) {
                        stored.extend(patch);
                    }
                }
                None => rows.push(row),
            }
            Ok(())
        })
    }

    fn insert_row<'a>(&'a self, table: &'a str, row: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.check()?;
            let id = self.data.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let created_at = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap() + Duration::minutes(id);
            let mut stored = row;
            if let Value::Object(map) = &mut stored {
                map.insert("id".to_string(), json!(id));
                map.insert("created_at".to_string(), json!(created_at));
            }
            self.data
                .tables
                .lock()
                .unwrap()
                .entry(table.to_string())
                .or_default()
                .push(stored.clone());
            Ok(stored)
        })
    }

    fn update_rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a RowFilter,
        patch: Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check()?;
            let mut tables = self.data.tables.lock().unwrap();
            for row in tables.entry(table.to_string()).or_default() {
                if !filter.matches(row) {
                    continue;
                }
                if let (Value::Object(stored), Value::Object(patch)) = (row, &patch) {
                    stored.extend(patch.clone());
                }
            }
            Ok(())
        })
    }

    fn delete_rows<'a>(&'a self, table: &'a str, filter: &'a RowFilter) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check()?;
            if let Some(rows) = self.data.tables.lock().unwrap().get_mut(table) {
                rows.retain(|row| !filter.matches(row));
            }
            Ok(())
        })
    }
}
