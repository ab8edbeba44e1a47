//! Health reporting for Nerva.
//!
//! Combines the circuit breaker's view of the upstream with the state of the
//! served snapshot.

use crate::cache::{CacheStats, ConsolidationCache};
use crate::core::{BreakerStatus, CircuitState};
use crate::upstream::QueryExecutor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// System health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    /// Upstream calls flowing normally.
    Healthy,
    /// A trial call is probing a recovering upstream.
    Degraded,
    /// Upstream calls are being refused.
    Unhealthy,
}

impl SystemHealth {
    /// Health implied by a breaker state.
    pub fn from_circuit(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => SystemHealth::Healthy,
            CircuitState::HalfOpen => SystemHealth::Degraded,
            CircuitState::Open => SystemHealth::Unhealthy,
        }
    }

    /// Get severity score (0-100).
    pub fn severity(&self) -> u8 {
        match self {
            SystemHealth::Healthy => 0,
            SystemHealth::Degraded => 50,
            SystemHealth::Unhealthy => 100,
        }
    }
}

/// Point-in-time health of the collector and cache.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall health.
    pub status: SystemHealth,
    /// Circuit breaker counters.
    pub circuit_breaker: BreakerStatus,
    /// Served snapshot statistics.
    pub cache: CacheStats,
    /// Last upstream call that returned data.
    pub last_successful_request: Option<DateTime<Utc>>,
    /// When the report was taken.
    pub checked_at: DateTime<Utc>,
}

/// Builds health reports from the shared services.
pub struct Monitor {
    executor: Arc<QueryExecutor>,
    cache: Arc<ConsolidationCache>,
}

impl Monitor {
    /// Create a monitor over the shared executor and cache.
    pub fn new(executor: Arc<QueryExecutor>, cache: Arc<ConsolidationCache>) -> Self {
        Self { executor, cache }
    }

    /// Take a health report.
    pub fn report(&self) -> HealthReport {
        let circuit_breaker = self.executor.breaker().status();
        HealthReport {
            status: SystemHealth::from_circuit(circuit_breaker.state),
            circuit_breaker,
            cache: self.cache.stats(),
            last_successful_request: self.executor.last_success(),
            checked_at: Utc::now(),
        }
    }
}
