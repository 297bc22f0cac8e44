//! Client for the managed auth/database provider.
//!
//! The provider exposes a PostgREST style row API under `/rest/v1/{table}`
//! and a GoTrue style auth API under `/auth/v1`. The worker only needs a
//! handful of row operations, so they are expressed as the [`RowStore`]
//! trait and the REST client is one implementation of it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{header, Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::ProviderConfig;
use crate::error::{Result, WorkerError};

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Equality filters and ordering applied to a row read, update or delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    pub eq: Vec<(String, Value)>,
    /// Column and ascending flag.
    pub order: Option<(String, bool)>,
}

impl RowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.eq.push((column.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }

    /// Whether a row satisfies every equality filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.eq
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }

    /// PostgREST query parameters (`col=eq.value`, `order=col.desc`).
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .eq
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", query_value(value))))
            .collect();
        if let Some((column, ascending)) = &self.order {
            let direction = if *ascending { "asc" } else { "desc" };
            query.push(("order".to_string(), format!("{}.{}", column, direction)));
        }
        query
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Row operations the record services rely on. Rows are JSON objects.
pub trait RowStore: Send + Sync {
    /// Resolve an access token to a user id. `None` when the provider does
    /// not recognise the token.
    fn verify_token<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// A store whose row operations run as the user owning `token`, so the
    /// provider's row-level policies apply to that user.
    fn for_token(&self, token: &str) -> Arc<dyn RowStore>;

    fn read_rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a RowFilter,
    ) -> BoxFuture<'a, Result<Vec<Value>>>;

    /// Insert, or merge into the row with the same conflict key values.
    fn upsert_row<'a>(
        &'a self,
        table: &'a str,
        row: Value,
        conflict_keys: &'a [&'a str],
    ) -> BoxFuture<'a, Result<()>>;

    /// Insert a row and return it as stored (with generated columns).
    fn insert_row<'a>(&'a self, table: &'a str, row: Value) -> BoxFuture<'a, Result<Value>>;

    fn update_rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a RowFilter,
        patch: Value,
    ) -> BoxFuture<'a, Result<()>>;

    fn delete_rows<'a>(&'a self, table: &'a str, filter: &'a RowFilter) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
}

/// REST client for the provider.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestRowStore {
    client: Client,
    base: Url,
    anon_key: String,
    token: Option<String>,
}

impl RestRowStore {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| WorkerError::Validation("provider url is not configured".to_string()))?;
        let anon_key = config
            .anon_key
            .clone()
            .ok_or_else(|| WorkerError::Validation("provider key is not configured".to_string()))?;
        let base = Url::parse(url)
            .map_err(|e| WorkerError::Validation(format!("invalid provider url {}: {}", url, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| WorkerError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            anon_key,
            token: None,
        })
    }

    /// Act on behalf of a signed-in user, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base: self.base.clone(),
            anon_key: self.anon_key.clone(),
            token: Some(token),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| WorkerError::Validation(format!("invalid provider path {}: {}", path, e)))
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.endpoint(&format!("rest/v1/{}", table))
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let bearer = self.token.as_deref().unwrap_or(&self.anon_key);
        self.client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(WorkerError::from_status(status, &body))
        }
    }

    async fn fetch_user(&self, token: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.endpoint("auth/v1/user")?)
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!(status = response.status().as_u16(), "Token rejected");
            return Ok(None);
        }
        let user: AuthUser = Self::check_response(response).await?.json().await?;
        Ok(Some(user.id))
    }

    async fn select(&self, table: &str, filter: &RowFilter) -> Result<Vec<Value>> {
        let response = self
            .request(Method::GET, self.table_url(table)?)
            .query(&[("select", "*")])
            .query(&filter.to_query())
            .send()
            .await?;
        let rows: Vec<Value> = Self::check_response(response).await?.json().await?;
        debug!(table, rows = rows.len(), "Read rows");
        Ok(rows)
    }

    async fn upsert(&self, table: &str, row: Value, conflict_keys: &[&str]) -> Result<()> {
        let response = self
            .request(Method::POST, self.table_url(table)?)
            .query(&[("on_conflict", conflict_keys.join(","))])
            .header("Prefer", "resolution=merge-duplicates")
            .json(&row)
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let response = self
            .request(Method::POST, self.table_url(table)?)
            .header("Prefer", "return=representation")
            .header(header::ACCEPT, "application/vnd.pgrst.object+json")
            .json(&row)
            .send()
            .await?;
        Ok(Self::check_response(response).await?.json().await?)
    }

    async fn update(&self, table: &str, filter: &RowFilter, patch: Value) -> Result<()> {
        if filter.eq.is_empty() {
            return Err(WorkerError::Validation(format!(
                "refusing unfiltered update of {}",
                table
            )));
        }
        let response = self
            .request(Method::PATCH, self.table_url(table)?)
            .query(&filter.to_query())
            .json(&patch)
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<()> {
        if filter.eq.is_empty() {
            warn!(table, "Refusing unfiltered delete");
            return Err(WorkerError::Validation(format!(
                "refusing unfiltered delete of {}",
                table
            )));
        }
        let response = self
            .request(Method::DELETE, self.table_url(table)?)
            .query(&filter.to_query())
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }
}

impl RowStore for RestRowStore {
    fn verify_token<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(self.fetch_user(token))
    }

    fn for_token(&self, token: &str) -> Arc<dyn RowStore> {
        Arc::new(self.with_token(token.to_string()))
    }

    fn read_rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a RowFilter,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(self.select(table, filter))
    }

    fn upsert_row<'a>(
        &'a self,
        table: &'a str,
        row: Value,
        conflict_keys: &'a [&'a str],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.upsert(table, row, conflict_keys))
    }

    fn insert_row<'a>(&'a self, table: &'a str, row: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(self.insert(table, row))
    }

    fn update_rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a RowFilter,
        patch: Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.update(table, filter, patch))
    }

    fn delete_rows<'a>(&'a self, table: &'a str, filter: &'a RowFilter) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.delete(table, filter))
    }
}

impl std::fmt::Debug for RestRowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRowStore")
            .field("base", &self.base.as_str())
            .field("user_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}
