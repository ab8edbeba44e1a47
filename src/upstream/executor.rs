//! Breaker-guarded, retrying query execution.

use crate::core::config::{Config, Credentials, RetrySettings};
use crate::core::{backoff_delay, CircuitBreaker, CircuitState, NervaError, Result};
use crate::upstream::query::Query;
use crate::upstream::transport::{Transport, UpstreamRequest};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Longest response body kept in an `UpstreamHttp` error.
const MAX_ERROR_BODY: usize = 500;

/// Per-call options for [`QueryExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Headers sent with every attempt
    pub headers: Vec<(String, String)>,
    /// Deadline for each attempt
    pub timeout: Duration,
    /// Retry budget and backoff
    pub retry: RetrySettings,
}

impl ExecuteOptions {
    /// Options derived from configuration, authenticated with `credentials`.
    pub fn from_config(config: &Config, credentials: &Credentials) -> Self {
        Self {
            headers: vec![
                ("Api-Key".to_string(), credentials.api_key.clone()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            timeout: config.upstream.timeout,
            retry: config.retry.clone(),
        }
    }
}

/// Executes upstream queries through the shared circuit breaker.
///
/// Every attempt also passes a process-wide gate: at most `max_in_flight`
/// requests are outstanding, and consecutive request starts are spaced by
/// at least `min_interval`.
pub struct QueryExecutor {
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    max_query_length: usize,
    in_flight: Semaphore,
    min_interval: Duration,
    next_start: Mutex<Option<Instant>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl QueryExecutor {
    /// Create an executor over `transport`, sharing `breaker`.
    pub fn new(
        transport: Arc<dyn Transport>,
        breaker: Arc<CircuitBreaker>,
        max_query_length: usize,
    ) -> Self {
        Self {
            transport,
            breaker,
            max_query_length,
            in_flight: Semaphore::new(Semaphore::MAX_PERMITS),
            min_interval: Duration::ZERO,
            next_start: Mutex::new(None),
            last_success: Mutex::new(None),
        }
    }

    /// Limit concurrent requests and space out their starts.
    pub fn with_pacing(mut self, max_in_flight: usize, min_interval: Duration) -> Self {
        self.in_flight = Semaphore::new(max_in_flight.clamp(1, Semaphore::MAX_PERMITS));
        self.min_interval = min_interval;
        self
    }

    /// The breaker every call goes through.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Time of the last call that returned a well-formed result.
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock()
    }

    /// Run `query`, retrying recoverable failures with exponential backoff.
    ///
    /// Returns the result rows; an empty vector means the query succeeded
    /// and matched nothing.
    pub async fn execute(&self, query: &Query, options: &ExecuteOptions) -> Result<Vec<Value>> {
        let mut attempt: u32 = 0;

        loop {
            let permit = self.acquire_slot().await?;

            if !self.breaker.admit() {
                return Err(self.circuit_open(query));
            }

            if let Err(e) = query.validate(self.max_query_length) {
                self.breaker.release_trial();
                error!(query = %query.describe(), error = %e, "Rejected invalid query");
                return Err(e);
            }

            let outcome = self.send_once(query, options).await;
            drop(permit);

            match outcome {
                Ok(rows) => {
                    self.breaker.record_success();
                    *self.last_success.lock() = Some(Utc::now());
                    debug!(query = %query.describe(), rows = rows.len(), attempt, "Query succeeded");
                    return Ok(rows);
                },
                Err(e) => {
                    self.breaker.record_failure(e.is_rate_limit());

                    if !e.is_recoverable() || attempt >= options.retry.max_retries {
                        warn!(
                            query = %query.describe(),
                            error = %e,
                            category = e.category(),
                            attempts = attempt + 1,
                            "Query failed"
                        );
                        return Err(e);
                    }

                    if self.breaker.state() == CircuitState::Open {
                        return Err(self.circuit_open(query));
                    }

                    let delay = backoff_delay(&options.retry, attempt);
                    warn!(
                        query = %query.describe(),
                        error = %e,
                        attempt = attempt + 1,
                        delay = ?delay,
                        "Query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }

    /// Wait for an in-flight slot and for this request's start time.
    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        let permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| NervaError::network("request limiter closed"))?;

        if !self.min_interval.is_zero() {
            let wait = {
                let mut next_start = self.next_start.lock();
                let now = Instant::now();
                let start = next_start.map_or(now, |at| at.max(now));
                *next_start = Some(start + self.min_interval);
                start - now
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        Ok(permit)
    }

    fn circuit_open(&self, query: &Query) -> NervaError {
        let retry_in = self.breaker.status().time_until_retry;
        warn!(
            query = %query.describe(),
            retry_in = ?retry_in,
            "Circuit breaker open, skipping upstream call"
        );
        NervaError::CircuitOpen {
            retry_in_ms: u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn send_once(&self, query: &Query, options: &ExecuteOptions) -> Result<Vec<Value>> {
        let request = UpstreamRequest {
            body: json!({ "query": query.render() }),
            headers: options.headers.clone(),
            timeout: options.timeout,
        };

        let timeout_ms = u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX);
        let response = tokio::time::timeout(options.timeout, self.transport.send(request))
            .await
            .map_err(|_| NervaError::UpstreamTimeout { timeout_ms })??;

        if (200..300).contains(&response.status) {
            query.parse_response(&response.body)
        } else {
            Err(NervaError::UpstreamHttp {
                status: response.status,
                body: truncate(response.body, MAX_ERROR_BODY),
            })
        }
    }
}

fn truncate(mut body: String, max: usize) -> String {
    if let Some((cut, _)) = body.char_indices().nth(max) {
        body.truncate(cut);
    }
    body
}
