//! HTTP transport seam between the executor and the network.

use crate::core::{NervaError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// A single POST to the upstream endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// JSON request body
    pub body: Value,
    /// Extra headers, including authentication
    pub headers: Vec<(String, String)>,
    /// Deadline for the whole exchange
    pub timeout: Duration,
}

/// Raw upstream reply; status interpretation is left to the executor.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body text
    pub body: String,
}

/// Something that can carry an upstream request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. Non-2xx replies are returned, not raised.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// `reqwest`-backed transport for the GraphQL endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport posting to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nerva/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NervaError::network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);

        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout)
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NervaError::UpstreamTimeout { timeout_ms }
            } else {
                NervaError::network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                NervaError::UpstreamTimeout { timeout_ms }
            } else {
                NervaError::network(format!("Failed to read response body: {e}"))
            }
        })?;

        Ok(UpstreamResponse { status, body })
    }
}
