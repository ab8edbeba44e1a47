//! Configuration management for Nerva.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Environment variable and CLI overrides (see `cli`)
//! - Validation and documented defaults

use crate::core::{Domain, NervaError, Period, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for Nerva
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream API configuration
    pub upstream: UpstreamConfig,
    /// Collection fan-out configuration
    pub collection: CollectionConfig,
    /// Retry configuration for upstream queries
    pub retry: RetrySettings,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerSettings,
    /// Entity validation configuration
    pub validation: ValidationConfig,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// GraphQL endpoint
    pub endpoint: String,
    /// API key sent in the `Api-Key` header
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Upstream account identifier
    pub account_id: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum rendered query length accepted before sending
    pub max_query_length: usize,
    /// Maximum entities kept from one domain search
    pub max_entities_per_domain: usize,
    /// Upstream requests in flight at once, across the whole process
    pub max_in_flight: usize,
    /// Minimum gap between the starts of two upstream requests
    #[serde(with = "humantime_serde")]
    pub min_request_interval: Duration,
}

/// Collection fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Domains to collect, deduplicated in consolidation order
    pub domains: Vec<Domain>,
    /// Metric periods fetched per entity
    pub periods: Vec<Period>,
    /// Concurrent entity metric collections per domain
    pub metric_concurrency: usize,
    /// Minimum valid entities for a run to replace the cache
    pub min_valid_entities: usize,
    /// Maximum rate-limited queries tolerated in one run
    pub max_rate_limit_failures: usize,
    /// Maximum domains whose search may fail in a run that replaces the cache
    pub max_failed_domains: usize,
}

/// Retry configuration for upstream queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff before the first retry, doubled per attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on a single backoff
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Add up to 10% random jitter to each backoff
    pub jitter: bool,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive failures that open the circuit when the latest is a rate limit
    pub rate_limit_threshold: u32,
    /// Base time the circuit stays open
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Cap for the cooldown after repeated failed trials
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
}

/// Entity validation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Validity policy
    pub mode: ValidationMode,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Durable snapshot location
    pub path: PathBuf,
    /// Age after which the snapshot is refreshed
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// How often the refresh loop checks staleness
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Structured logging format
    pub structured: bool,
}

/// Entity validity policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Keep any entity with a name
    Relaxed,
    /// Keep entities with a name and at least one substantive metric
    #[default]
    Rigorous,
}

impl std::str::FromStr for ValidationMode {
    type Err = NervaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxed" => Ok(ValidationMode::Relaxed),
            "rigorous" => Ok(ValidationMode::Rigorous),
            other => Err(NervaError::config(format!("Unknown validation mode: {other}"))),
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Upstream credentials, present and non-empty.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// API key
    pub api_key: String,
    /// Account identifier
    pub account_id: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            endpoint: "https://api.newrelic.com/graphql".to_string(),
            api_key: None,
            account_id: None,
            timeout: Duration::from_secs(30),
            max_query_length: 4000,
            max_entities_per_domain: 500,
            max_in_flight: 5,
            min_request_interval: Duration::from_millis(250),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        CollectionConfig {
            domains: Domain::ALL.to_vec(),
            periods: vec![Period::Minutes30, Period::Hours24, Period::Days7],
            metric_concurrency: 5,
            min_valid_entities: 1,
            max_rate_limit_failures: 5,
            max_failed_domains: 2,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        CircuitBreakerSettings {
            failure_threshold: 10,
            rate_limit_threshold: 3,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600), // 10 minutes
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: PathBuf::from("./nerva_data/cache.json"),
            max_age: Duration::from_secs(24 * 3600),
            check_interval: Duration::from_secs(3600),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl UpstreamConfig {
    /// Credentials required for any upstream call.
    pub fn credentials(&self) -> Result<Credentials> {
        let api_key = self.api_key.as_deref().map(str::trim).unwrap_or_default();
        let account_id = self.account_id.as_deref().map(str::trim).unwrap_or_default();

        if api_key.is_empty() || account_id.is_empty() {
            return Err(NervaError::config(
                "NEW_RELIC_API_KEY and NEW_RELIC_ACCOUNT_ID are required",
            ));
        }

        Ok(Credentials {
            api_key: api_key.to_string(),
            account_id: account_id.to_string(),
        })
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Upstream validation
        if self.upstream.endpoint.trim().is_empty() {
            return Err(NervaError::config("upstream endpoint must not be empty"));
        }

        if self.upstream.timeout.is_zero() {
            return Err(NervaError::config("upstream timeout must be greater than 0"));
        }

        if self.upstream.max_query_length == 0 {
            return Err(NervaError::config("max_query_length must be greater than 0"));
        }

        if self.upstream.max_entities_per_domain == 0 {
            return Err(NervaError::config("max_entities_per_domain must be greater than 0"));
        }

        if self.upstream.max_in_flight == 0 {
            return Err(NervaError::config("max_in_flight must be greater than 0"));
        }

        if let Some(account) = &self.upstream.account_id {
            if !account.trim().chars().all(|c| c.is_ascii_digit()) {
                return Err(NervaError::config(format!(
                    "account_id must be numeric, got '{}'",
                    account
                )));
            }
        }

        // Collection validation
        if self.collection.domains.is_empty() {
            return Err(NervaError::config("at least one domain must be collected"));
        }

        if self.collection.periods.is_empty() {
            return Err(NervaError::config("at least one metric period must be collected"));
        }

        if self.collection.metric_concurrency == 0 {
            return Err(NervaError::config("metric_concurrency must be greater than 0"));
        }

        // Retry validation
        if self.retry.max_delay < self.retry.base_delay {
            return Err(NervaError::config(format!(
                "retry max_delay ({:?}) must not be below base_delay ({:?})",
                self.retry.max_delay, self.retry.base_delay
            )));
        }

        // Circuit breaker validation
        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.rate_limit_threshold == 0 {
            return Err(NervaError::config("circuit breaker thresholds must be greater than 0"));
        }

        if breaker.cooldown.is_zero() {
            return Err(NervaError::config("circuit breaker cooldown must be greater than 0"));
        }

        if breaker.max_cooldown < breaker.cooldown {
            return Err(NervaError::config(format!(
                "circuit breaker max_cooldown ({:?}) must not be below cooldown ({:?})",
                breaker.max_cooldown, breaker.cooldown
            )));
        }

        // Cache validation
        if self.cache.path.as_os_str().is_empty() {
            return Err(NervaError::config("cache path must not be empty"));
        }

        if self.cache.check_interval.is_zero() {
            return Err(NervaError::config("cache check_interval must be greater than 0"));
        }

        Ok(())
    }

    /// Collected domains with duplicates removed, in consolidation order.
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains = self.collection.domains.clone();
        domains.sort();
        domains.dedup();
        domains
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| NervaError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set the upstream endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.upstream.endpoint = endpoint.into();
        self
    }

    /// Set the API key
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.upstream.api_key = Some(key.into());
        self
    }

    /// Set the account identifier
    pub fn account_id(mut self, account: impl Into<String>) -> Self {
        self.config.upstream.account_id = Some(account.into());
        self
    }

    /// Set the per-request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.upstream.timeout = timeout;
        self
    }

    /// Set the domains to collect
    pub fn domains(mut self, domains: Vec<Domain>) -> Self {
        self.config.collection.domains = domains;
        self
    }

    /// Set the metric periods to collect
    pub fn periods(mut self, periods: Vec<Period>) -> Self {
        self.config.collection.periods = periods;
        self
    }

    /// Set the validation mode
    pub fn validation_mode(mut self, mode: ValidationMode) -> Self {
        self.config.validation.mode = mode;
        self
    }

    /// Set the breaker failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Set the breaker cooldown
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.circuit_breaker.cooldown = cooldown;
        if self.config.circuit_breaker.max_cooldown < cooldown {
            self.config.circuit_breaker.max_cooldown = cooldown;
        }
        self
    }

    /// Set retry parameters
    pub fn retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.config.retry.max_retries = max_retries;
        self.config.retry.base_delay = base_delay;
        if self.config.retry.max_delay < base_delay {
            self.config.retry.max_delay = base_delay;
        }
        self
    }

    /// Set the global request limits
    pub fn pacing(mut self, max_in_flight: usize, min_request_interval: Duration) -> Self {
        self.config.upstream.max_in_flight = max_in_flight;
        self.config.upstream.min_request_interval = min_request_interval;
        self
    }

    /// Set how many failed domain searches a replacing run tolerates
    pub fn max_failed_domains(mut self, max: usize) -> Self {
        self.config.collection.max_failed_domains = max;
        self
    }

    /// Set the cache file path
    pub fn cache_path(mut self, path: PathBuf) -> Self {
        self.config.cache.path = path;
        self
    }

    /// Set the cache max age
    pub fn cache_max_age(mut self, max_age: Duration) -> Self {
        self.config.cache.max_age = max_age;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 10);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.validation.mode, ValidationMode::Rigorous);
    }

    #[test]
    fn test_missing_credentials() {
        let config = Config::default();
        assert!(matches!(config.upstream.credentials(), Err(NervaError::Config(_))));

        let config = ConfigBuilder::new().api_key("  ").account_id("123").build().unwrap();
        assert!(config.upstream.credentials().is_err());

        let config = ConfigBuilder::new().api_key("NRAK-1").account_id("123").build().unwrap();
        let creds = config.upstream.credentials().unwrap();
        assert_eq!(creds.account_id, "123");
    }

    #[test]
    fn test_invalid_breaker_settings() {
        let mut config = Config::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.circuit_breaker.max_cooldown = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pacing_limits() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.upstream.max_in_flight, 5);
        assert_eq!(config.upstream.min_request_interval, Duration::from_millis(250));
        assert_eq!(config.collection.max_failed_domains, 2);

        let config = ConfigBuilder::new().pacing(0, Duration::ZERO).build();
        assert!(config.is_err());
    }

    #[test]
    fn test_non_numeric_account() {
        let config = ConfigBuilder::new().account_id("acme").build();
        assert!(config.is_err());
    }

    #[test]
    fn test_domains_are_ordered_and_unique() {
        let config = ConfigBuilder::new()
            .domains(vec![Domain::Infra, Domain::Apm, Domain::Infra])
            .build()
            .unwrap();
        assert_eq!(config.domains(), vec![Domain::Apm, Domain::Infra]);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
upstream:
  account_id: "4242"
  timeout: 10s
collection:
  domains: [INFRA, APM]
  periods: ["30min", "7d"]
circuit_breaker:
  failure_threshold: 4
  cooldown: 30s
validation:
  mode: relaxed
cache:
  path: /tmp/nerva/cache.json
  max_age: 12h
"#;

        let config = ConfigBuilder::new().from_yaml(yaml).unwrap().build().unwrap();

        assert_eq!(config.upstream.account_id.as_deref(), Some("4242"));
        assert_eq!(config.upstream.timeout, Duration::from_secs(10));
        assert_eq!(config.collection.periods, vec![Period::Minutes30, Period::Days7]);
        assert_eq!(config.circuit_breaker.failure_threshold, 4);
        assert_eq!(config.circuit_breaker.rate_limit_threshold, 3);
        assert_eq!(config.validation.mode, ValidationMode::Relaxed);
        assert_eq!(config.cache.max_age, Duration::from_secs(12 * 3600));
        assert_eq!(config.domains(), vec![Domain::Apm, Domain::Infra]);
    }
}
