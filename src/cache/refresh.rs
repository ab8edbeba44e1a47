//! Single-flight consolidation runs: collect, filter, merge, persist.

use crate::cache::{CacheSnapshot, ConsolidationCache, SnapshotSource};
use crate::collector::EntityCollector;
use crate::core::{Config, Domain, Entity, NervaError, Result};
use crate::validation::EntityValidator;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// What a refresh run did to the served snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Fresh data replaced the snapshot
    Refreshed { entities: usize },
    /// The run was insufficient; the previous snapshot is still served
    KeptPrevious { entities: usize, reason: String },
}

/// Runs consolidation with at most one run in flight.
pub struct CacheRefresher {
    collector: Arc<EntityCollector>,
    validator: EntityValidator,
    cache: Arc<ConsolidationCache>,
    config: Arc<Config>,
    run_lock: tokio::sync::Mutex<()>,
    completed_runs: AtomicU64,
    last_outcome: Mutex<Option<std::result::Result<RefreshOutcome, String>>>,
}

impl CacheRefresher {
    pub fn new(
        collector: Arc<EntityCollector>,
        cache: Arc<ConsolidationCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            collector,
            validator: EntityValidator::new(config.validation.mode),
            cache,
            config,
            run_lock: tokio::sync::Mutex::new(()),
            completed_runs: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<ConsolidationCache> {
        &self.cache
    }

    /// Whether the served snapshot should be recollected.
    pub fn needs_refresh(&self) -> bool {
        self.cache.needs_refresh()
    }

    /// Run one consolidation, or wait for the run already in flight and
    /// return its outcome.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let observed = self.completed_runs.load(Ordering::SeqCst);
        let _guard = self.run_lock.lock().await;

        if self.completed_runs.load(Ordering::SeqCst) != observed {
            info!("Joined an in-flight consolidation run");
            return match self.last_outcome.lock().clone() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(message)) => Err(NervaError::RefreshFailed(message)),
                None => Err(NervaError::RefreshFailed("no outcome recorded".to_string())),
            };
        }

        let result = self.run().await;
        *self.last_outcome.lock() = Some(match &result {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(e.to_string()),
        });
        self.completed_runs.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn run(&self) -> Result<RefreshOutcome> {
        let report = self.collector.collect_all(&self.config.domains()).await?;

        let mut filtered: BTreeMap<Domain, Vec<Entity>> = BTreeMap::new();
        let mut valid = 0usize;
        for (domain, entities) in report.entities {
            let kept = self.validator.filter(entities);
            valid += kept.len();
            filtered.insert(domain, kept);
        }

        let collection = &self.config.collection;
        let insufficient = if valid < collection.min_valid_entities {
            Some(format!(
                "only {valid} valid entities, need at least {}",
                collection.min_valid_entities
            ))
        } else if report.failed_domains > collection.max_failed_domains {
            Some(format!(
                "{} domain searches failed, tolerating at most {}",
                report.failed_domains, collection.max_failed_domains
            ))
        } else if report.rate_limited_failures > collection.max_rate_limit_failures {
            Some(format!(
                "{} rate-limited queries, tolerating at most {}",
                report.rate_limited_failures, collection.max_rate_limit_failures
            ))
        } else {
            None
        };

        let Some(reason) = insufficient else {
            let merged = self.cache.merge(filtered);
            let persisted = self.cache.persist(&merged).await?;
            info!(entities = persisted.len(), "Consolidation run refreshed the cache");
            return Ok(RefreshOutcome::Refreshed {
                entities: persisted.len(),
            });
        };

        let previous = self.cache.read();
        if previous.is_empty() {
            error!(reason = %reason, "Consolidation run insufficient and no previous data to serve");
            return Err(NervaError::CollectionInsufficient(reason));
        }

        warn!(
            reason = %reason,
            entities = previous.len(),
            "Consolidation run insufficient, keeping previous snapshot"
        );

        // generated_at stays with the data; only the check is recorded.
        let mut kept = CacheSnapshot::clone(&previous);
        kept.source = SnapshotSource::Fallback;
        kept.fallback_reason = Some(reason.clone());
        kept.last_check = Some(Utc::now());
        let kept = self.cache.install(kept);
        self.cache.persist(&kept).await?;

        Ok(RefreshOutcome::KeptPrevious {
            entities: kept.len(),
            reason,
        })
    }
}
