//! Common test utilities and fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use nerva_lib::core::config::ConfigBuilder;
use nerva_lib::core::{Config, Domain, Entity, MetricSet, Result};
use nerva_lib::upstream::{Transport, UpstreamRequest, UpstreamResponse};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Test fixture builder for creating entities with sensible defaults.
pub struct TestEntityBuilder {
    id: String,
    name: String,
    domain: Domain,
    kind: String,
    metrics: Vec<(String, String, Value)>,
    tainted: bool,
}

impl TestEntityBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("{id}-service"),
            domain: Domain::Apm,
            kind: "APPLICATION".to_string(),
            metrics: Vec::new(),
            tainted: false,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn metric(mut self, period: &str, name: &str, value: Value) -> Self {
        self.metrics.push((period.to_string(), name.to_string(), value));
        self
    }

    pub fn tainted(mut self) -> Self {
        self.tainted = true;
        self
    }

    pub fn build(self) -> Entity {
        let mut entity = Entity::new(self.id, self.name, self.domain, self.kind);
        for (period, name, value) in self.metrics {
            entity
                .metrics
                .entry(period)
                .or_insert_with(MetricSet::new)
                .insert(name, value);
        }
        entity.tainted = self.tainted;
        entity
    }
}

/// Config pointing at a cache file in `dir`, with fast retries and
/// credentials set.
pub fn test_config(dir: &Path, domains: Vec<Domain>) -> ConfigBuilder {
    ConfigBuilder::new()
        .api_key("test-key")
        .account_id("12345")
        .domains(domains)
        .periods(vec![nerva_lib::core::Period::Minutes30])
        .retries(0, Duration::from_millis(1))
        .pacing(5, Duration::ZERO)
        .cache_path(dir.join("cache.json"))
}

pub fn build_config(builder: ConfigBuilder) -> Config {
    builder.build().expect("valid test config")
}

/// Entity search result row.
pub fn search_row(guid: &str, name: &str, domain: Domain) -> Value {
    json!({"guid": guid, "name": name, "domain": domain.as_str(), "entityType": "APPLICATION"})
}

pub fn nrql_body(rows: Value) -> String {
    json!({"data": {"actor": {"account": {"nrql": {"results": rows}}}}}).to_string()
}

pub fn search_body(rows: Vec<Value>) -> String {
    json!({"data": {"actor": {"entitySearch": {
        "results": {"entities": rows},
        "count": rows.len()
    }}}})
    .to_string()
}

/// In-memory upstream that answers entity searches per domain and every NRQL
/// query with the same rows.
pub struct FakeUpstream {
    entities: Mutex<HashMap<Domain, Vec<Value>>>,
    metric_rows: Mutex<Value>,
    scripted: Mutex<VecDeque<UpstreamResponse>>,
    fail_with: Mutex<Option<u16>>,
    failing_domains: Mutex<HashMap<Domain, u16>>,
    delay: Duration,
    searches: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            entities: Mutex::new(HashMap::new()),
            metric_rows: Mutex::new(json!([{"score": 0.9}])),
            scripted: Mutex::new(VecDeque::new()),
            fail_with: Mutex::new(None),
            failing_domains: Mutex::new(HashMap::new()),
            delay,
            searches: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_entities(self, domain: Domain, rows: Vec<Value>) -> Self {
        self.entities.lock().insert(domain, rows);
        self
    }

    pub fn set_metric_rows(&self, rows: Value) {
        *self.metric_rows.lock() = rows;
    }

    /// Answer every call with `status` until cleared.
    pub fn fail_with(&self, status: Option<u16>) {
        *self.fail_with.lock() = status;
    }

    /// Answer entity searches for `domain` with `status`.
    pub fn fail_domain(&self, domain: Domain, status: u16) {
        self.failing_domains.lock().insert(domain, status);
    }

    /// Queue one response served ahead of the normal answers.
    pub fn push_response(&self, status: u16, body: &str) {
        self.scripted.lock().push_back(UpstreamResponse {
            status,
            body: body.to_string(),
        });
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most requests that were ever outstanding at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, document: &str) -> UpstreamResponse {
        if let Some(status) = *self.fail_with.lock() {
            return UpstreamResponse {
                status,
                body: "upstream unavailable".to_string(),
            };
        }
        if let Some(response) = self.scripted.lock().pop_front() {
            return response;
        }

        if document.contains("entitySearch") {
            let domain = Domain::ALL
                .iter()
                .find(|d| document.contains(&format!("domain = '{}'", d.as_str())));
            if let Some(status) = domain.and_then(|d| self.failing_domains.lock().get(d).copied()) {
                return UpstreamResponse {
                    status,
                    body: "search unavailable".to_string(),
                };
            }

            self.searches.fetch_add(1, Ordering::SeqCst);
            let rows = domain
                .and_then(|d| self.entities.lock().get(d).cloned())
                .unwrap_or_default();
            return UpstreamResponse {
                status: 200,
                body: search_body(rows),
            };
        }

        UpstreamResponse {
            status: 200,
            body: nrql_body(self.metric_rows.lock().clone()),
        }
    }
}

#[async_trait]
impl Transport for FakeUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let document = request.body["query"].as_str().unwrap_or_default().to_string();
        let response = self.answer(&document);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response)
    }
}
