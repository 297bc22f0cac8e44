use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use super::Network;
use crate::error::{Result, WorkerError};
use crate::models::{Request, Response};

/// HTTP request timeout in seconds.
/// The worker itself has no timeout; this is the network stack's own.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Network backed by a real HTTP client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| WorkerError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn send(&self, request: &Request) -> Result<Response> {
        let mut builder = self.client.request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            WorkerError::Network(format!("{} {}: {}", request.method, request.url, e))
        })?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| WorkerError::Network(format!("reading body of {}: {}", request.url, e)))?;

        debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "Network response");

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body: body.to_vec(),
            from_cache: false,
        })
    }
}

impl Network for HttpNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
        Box::pin(self.send(request))
    }
}
