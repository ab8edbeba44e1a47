//! Core domain models, configuration and failure handling for Nerva.
//!
//! This module contains the fundamental types shared by the collector,
//! validator and consolidation cache.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder, Credentials, ValidationMode};
pub use error::{NervaError, Result};
pub use retry::{backoff_delay, BreakerStatus, CircuitBreaker, CircuitState};
pub use types::{Domain, Entity, MetricSet, Period};
