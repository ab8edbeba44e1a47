//! Upstream telemetry API access.
//!
//! Queries are rendered into GraphQL documents ([`query`]), carried by a
//! [`Transport`] and executed through the shared circuit breaker with
//! bounded retries ([`executor`]).

pub mod executor;
pub mod query;
pub mod transport;

pub use executor::{ExecuteOptions, QueryExecutor};
pub use query::{nrql_literal, Query};
pub use transport::{HttpTransport, Transport, UpstreamRequest, UpstreamResponse};
