//! Main application entry point for Nerva.

use crate::cache::{CacheRefresher, CacheSnapshot, ConsolidationCache, RefreshOutcome};
use crate::collector::EntityCollector;
use crate::core::{CircuitBreaker, Config, NervaError, Result};
use crate::monitoring::{HealthReport, Monitor};
use crate::upstream::{HttpTransport, QueryExecutor, Transport};
use std::future::Future;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// Main application struct that wires the collector, cache and monitor.
pub struct Application {
    /// Application configuration
    config: Arc<Config>,
    /// Breaker-guarded upstream access
    executor: Arc<QueryExecutor>,
    /// Served snapshot
    cache: Arc<ConsolidationCache>,
    /// Single-flight consolidation runs
    refresher: Arc<CacheRefresher>,
    /// Health reporting
    monitor: Arc<Monitor>,
}

impl Application {
    /// Create a new Application talking HTTP to the configured endpoint.
    pub fn new(config: Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.upstream.endpoint.clone())?);
        Self::with_transport(config, transport)
    }

    /// Create a new Application over an arbitrary transport.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let executor = Arc::new(
            QueryExecutor::new(transport, breaker, config.upstream.max_query_length).with_pacing(
                config.upstream.max_in_flight,
                config.upstream.min_request_interval,
            ),
        );
        let cache = Arc::new(ConsolidationCache::new(&config.cache));
        let collector = Arc::new(EntityCollector::new(Arc::clone(&executor), Arc::clone(&config)));
        let refresher = Arc::new(CacheRefresher::new(
            collector,
            Arc::clone(&cache),
            Arc::clone(&config),
        ));
        let monitor = Arc::new(Monitor::new(Arc::clone(&executor), Arc::clone(&cache)));

        Ok(Self {
            config,
            executor,
            cache,
            refresher,
            monitor,
        })
    }

    /// Install the durable snapshot if it is still fresh.
    pub async fn restore(&self) -> Option<Arc<CacheSnapshot>> {
        self.cache.restore().await
    }

    /// Run a single consolidation.
    pub async fn refresh_once(&self) -> Result<RefreshOutcome> {
        self.refresher.refresh().await
    }

    /// Current health report.
    pub fn health(&self) -> HealthReport {
        self.monitor.report()
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        };
        self.run_until(shutdown).await
    }

    /// Restore from disk, then refresh whenever the snapshot goes stale,
    /// checking every `cache.check_interval`, until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            endpoint = %self.config.upstream.endpoint,
            domains = ?self.config.domains(),
            check_interval = ?self.config.cache.check_interval,
            "Starting Nerva"
        );

        self.restore().await;

        let mut ticker = tokio::time::interval(self.config.cache.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.tick() => {},
                        _ = &mut shutdown => break,
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("Received shutdown signal, stopping...");
        Ok(())
    }

    async fn tick(&self) {
        if !self.refresher.needs_refresh() {
            tracing::debug!("Snapshot is fresh, skipping refresh");
            return;
        }

        match self.refresher.refresh().await {
            Ok(RefreshOutcome::Refreshed { entities }) => {
                tracing::info!(entities, "Cache refreshed");
            },
            Ok(RefreshOutcome::KeptPrevious { entities, reason }) => {
                tracing::warn!(entities, reason = %reason, "Serving previous snapshot");
            },
            Err(e @ NervaError::CircuitOpen { .. }) => {
                tracing::warn!(error = %e, "Refresh skipped, upstream unavailable");
            },
            Err(e) => {
                tracing::error!(error = %e, category = e.category(), "Refresh failed");
            },
        }
    }

    /// Get the application configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Get a reference to the query executor.
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Get a reference to the consolidation cache.
    pub fn cache(&self) -> &Arc<ConsolidationCache> {
        &self.cache
    }

    /// Get a reference to the refresher.
    pub fn refresher(&self) -> &Arc<CacheRefresher> {
        &self.refresher
    }
}
