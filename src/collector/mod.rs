//! Per-domain entity discovery and metric collection.
//!
//! A collection run searches every requested domain concurrently, then
//! fetches each entity's metric catalog with bounded concurrency. Item
//! failures are counted and absorbed; an open circuit or missing credentials
//! abort the whole run.
//!
//! When the breaker is not closed at the start of a run, the first domain is
//! collected alone so its search can act as the single half-open trial
//! before the other domains fan out.

pub mod catalog;

use crate::core::{CircuitState, Config, Domain, Entity, MetricSet, NervaError, Result};
use crate::upstream::{ExecuteOptions, Query, QueryExecutor};
use crate::validation::normalize_value;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of one collection run.
#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    /// Collected entities per domain, in search order
    pub entities: BTreeMap<Domain, Vec<Entity>>,
    /// Domains whose entity search failed
    pub failed_domains: usize,
    /// Metric queries that failed after retries
    pub failed_metric_queries: usize,
    /// Failures caused by upstream rate limiting
    pub rate_limited_failures: usize,
    /// Entities returned by the searches
    pub entities_seen: usize,
    /// Wall time of the run
    pub elapsed: Duration,
}

impl CollectionReport {
    /// Total number of collected entities.
    pub fn total_entities(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    /// Fold one domain's result in. Catastrophic errors are handed back.
    fn absorb_domain(&mut self, domain: Domain, result: Result<(Vec<Entity>, Tally)>) -> Result<()> {
        match result {
            Ok((entities, tally)) => {
                self.entities_seen += entities.len();
                self.failed_metric_queries += tally.failed_queries;
                self.rate_limited_failures += tally.rate_limited;
                self.entities.insert(domain, entities);
            },
            Err(e) if is_catastrophic(&e) => {
                warn!(domain = %domain, error = %e, "Aborting collection run");
                return Err(e);
            },
            Err(e) => {
                warn!(domain = %domain, error = %e, "Domain collection failed");
                self.failed_domains += 1;
                if e.is_rate_limit() {
                    self.rate_limited_failures += 1;
                }
            },
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tally {
    failed_queries: usize,
    rate_limited: usize,
}

impl Tally {
    fn absorb(&mut self, error: &NervaError) {
        self.failed_queries += 1;
        if error.is_rate_limit() {
            self.rate_limited += 1;
        }
    }
}

/// Errors that end the whole run instead of one item.
fn is_catastrophic(error: &NervaError) -> bool {
    matches!(error, NervaError::CircuitOpen { .. } | NervaError::Config(_))
}

/// Collects entities and their metrics from the upstream.
pub struct EntityCollector {
    executor: Arc<QueryExecutor>,
    config: Arc<Config>,
}

impl EntityCollector {
    pub fn new(executor: Arc<QueryExecutor>, config: Arc<Config>) -> Self {
        Self { executor, config }
    }

    /// Collect every domain in `domains`.
    pub async fn collect_all(&self, domains: &[Domain]) -> Result<CollectionReport> {
        let credentials = self.config.upstream.credentials()?;
        let options = ExecuteOptions::from_config(&self.config, &credentials);
        let account_id = credentials.account_id.as_str();

        let mut domains = domains.to_vec();
        domains.sort();
        domains.dedup();

        let started = Instant::now();
        info!(domains = ?domains, "Starting collection run");

        let mut report = CollectionReport::default();
        let mut pending = domains.as_slice();

        if self.executor.breaker().state() != CircuitState::Closed {
            if let Some((lead, rest)) = pending.split_first() {
                info!(domain = %lead, "Circuit not closed, collecting one domain ahead of the rest");
                let result = self.collect_domain(*lead, account_id, &options).await;
                report.absorb_domain(*lead, result)?;
                pending = rest;
            }
        }

        let results = join_all(
            pending
                .iter()
                .map(|domain| self.collect_domain(*domain, account_id, &options)),
        )
        .await;

        for (domain, result) in pending.iter().zip(results) {
            report.absorb_domain(*domain, result)?;
        }

        report.elapsed = started.elapsed();
        info!(
            entities = report.total_entities(),
            failed_domains = report.failed_domains,
            failed_metric_queries = report.failed_metric_queries,
            rate_limited = report.rate_limited_failures,
            elapsed = ?report.elapsed,
            "Collection run finished"
        );

        Ok(report)
    }

    async fn collect_domain(
        &self,
        domain: Domain,
        account_id: &str,
        options: &ExecuteOptions,
    ) -> Result<(Vec<Entity>, Tally)> {
        let rows = self
            .executor
            .execute(&Query::entity_search(account_id, domain), options)
            .await?;

        let limit = self.config.upstream.max_entities_per_domain;
        if rows.len() > limit {
            warn!(
                domain = %domain,
                found = rows.len(),
                limit,
                "Entity search truncated"
            );
        }

        let stubs: Vec<Entity> = rows
            .into_iter()
            .take(limit)
            .filter_map(|row| entity_from_search_row(domain, row))
            .collect();
        debug!(domain = %domain, entities = stubs.len(), "Entity search complete");

        let concurrency = self.config.collection.metric_concurrency.max(1);
        let mut collected: Vec<(usize, Result<(Entity, Tally)>)> = stream::iter(stubs.into_iter().enumerate())
            .map(|(index, entity)| async move {
                (index, self.collect_metrics(entity, account_id, options).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        collected.sort_by_key(|(index, _)| *index);

        let mut tally = Tally::default();
        let mut entities = Vec::with_capacity(collected.len());
        for (_, result) in collected {
            let (entity, entity_tally) = result?;
            tally.failed_queries += entity_tally.failed_queries;
            tally.rate_limited += entity_tally.rate_limited;
            entities.push(entity);
        }

        Ok((entities, tally))
    }

    async fn collect_metrics(
        &self,
        mut entity: Entity,
        account_id: &str,
        options: &ExecuteOptions,
    ) -> Result<(Entity, Tally)> {
        let mut tally = Tally::default();

        for period in &self.config.collection.periods {
            let mut metrics = MetricSet::new();

            for template in catalog::templates(entity.domain) {
                let query = Query::nrql(account_id, template.render(&entity.id, *period));
                match self.executor.execute(&query, options).await {
                    Ok(rows) if rows.is_empty() => {},
                    Ok(rows) => metrics.insert(template.name, normalize_value(Value::Array(rows))),
                    Err(e) if is_catastrophic(&e) => return Err(e),
                    Err(e) => {
                        debug!(
                            entity = %entity.id,
                            metric = template.name,
                            period = period.label(),
                            error = %e,
                            "Metric query failed"
                        );
                        tally.absorb(&e);
                    },
                }
            }

            if !metrics.is_empty() {
                entity.metrics.insert(period.label().to_string(), metrics);
            }
        }

        if tally.failed_queries > 0 {
            warn!(
                entity = %entity.id,
                name = %entity.name,
                failed = tally.failed_queries,
                "Some metric queries failed"
            );
        }

        Ok((entity, tally))
    }
}

/// Build an entity stub from one search result row.
fn entity_from_search_row(domain: Domain, row: Value) -> Option<Entity> {
    let text = |key: &str| {
        row.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };

    let guid = text("guid");
    let name = text("name");

    if guid.is_empty() {
        warn!(domain = %domain, name = %name, "Skipping entity without GUID");
        return None;
    }

    let reported = text("domain");
    if Domain::is_ignored(&reported) {
        warn!(domain = %reported, guid = %guid, "Skipping entity in ignored domain");
        return None;
    }

    Some(Entity::new(guid, name, domain, text("entityType")))
}
