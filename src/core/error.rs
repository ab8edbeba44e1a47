use thiserror::Error;

#[derive(Error, Debug)]
pub enum NervaError {
    #[error("Circuit breaker is open: upstream unavailable, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Upstream timeout: request took longer than {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    #[error("Upstream HTTP error {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    #[error("Upstream rate limit: {0}")]
    RateLimited(String),

    #[error("Query rejected by upstream: {0}")]
    QueryRejected(String),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("Cache file corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Collection insufficient: {0}")]
    CollectionInsufficient(String),

    #[error("Consolidation run failed: {0}")]
    RefreshFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Nerva operations
pub type Result<T> = std::result::Result<T, NervaError>;

impl NervaError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Creates a new invalid query error
    pub fn invalid_query<S: Into<String>>(msg: S) -> Self {
        Self::InvalidQuery(msg.into())
    }

    /// Creates a new malformed response error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Returns true if retrying the same request may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::UpstreamTimeout { .. }
            | Self::RateLimited(_)
            | Self::MalformedResponse(_)
            | Self::Network(_) => true,
            Self::UpstreamHttp { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns true if the upstream signalled a rate limit
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::UpstreamHttp { status, .. } => *status == 429,
            _ => false,
        }
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::InvalidQuery(_) => "validation",
            Self::UpstreamTimeout { .. } => "timeout",
            Self::UpstreamHttp { .. } | Self::Network(_) => "network",
            Self::RateLimited(_) => "rate_limit",
            Self::QueryRejected(_) | Self::MalformedResponse(_) => "upstream",
            Self::CacheCorrupt(_) | Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::CollectionInsufficient(_) | Self::RefreshFailed(_) => "collection",
            Self::Serialization(_) => "serialization",
        }
    }
}
