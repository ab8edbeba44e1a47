//! Nerva - resilient telemetry collection and consolidation cache.
//!
//! Nerva pulls entities and their metrics from an upstream observability
//! GraphQL API, filters out entities without real data, and serves one
//! deduplicated snapshot that survives upstream outages and restarts.
//!
//! # Features
//!
//! - **Circuit breaker**: one shared gate in front of every upstream call,
//!   tripping faster on rate limits
//! - **Bounded retries**: exponential backoff on transient failures only
//! - **Validation**: relaxed or rigorous entity filters
//! - **Consolidation**: first-seen-wins deduplication across domains, published
//!   with an atomic snapshot swap
//! - **Durability**: crash-safe cache file, restored at startup
//!
//! # Architecture
//!
//! - `core`: domain models, configuration, errors, circuit breaker
//! - `upstream`: queries, transport and the retrying executor
//! - `collector`: per-domain entity and metric collection
//! - `validation`: value normalization and validity policy
//! - `cache`: snapshot, persistence and single-flight refresh
//! - `monitoring`: health reporting
//! - `cli`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use nerva_lib::core::Config;
//! use nerva_lib::Application;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let app = Application::new(config)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod application;
pub mod cache;
pub mod cli;
pub mod collector;
pub mod core;
pub mod monitoring;
pub mod upstream;
pub mod validation;

// Re-export core types for convenience
pub use crate::application::Application;
pub use crate::cache::{CacheRefresher, CacheSnapshot, ConsolidationCache, RefreshOutcome};
pub use crate::collector::{CollectionReport, EntityCollector};
pub use crate::core::{CircuitBreaker, Config, NervaError, Result};
pub use crate::monitoring::HealthReport;
pub use crate::upstream::{HttpTransport, Query, QueryExecutor, Transport};
pub use crate::validation::EntityValidator;
