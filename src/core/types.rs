//! Core domain types for entity telemetry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::core::{NervaError, Result};

/// Coarse category of a monitored entity, used to scope collection queries.
///
/// The declaration order is the consolidation order: when the same GUID is
/// reported under several domains, the earliest domain wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Domain {
    /// Application performance monitoring
    Apm,
    /// Browser (real user monitoring)
    Browser,
    /// Infrastructure hosts
    Infra,
    /// Databases
    Db,
    /// Mobile applications
    Mobile,
    /// IoT devices
    Iot,
    /// Serverless functions
    Serverless,
    /// Synthetic monitors
    Synth,
    /// External services
    Ext,
}

impl Domain {
    /// All collectable domains, in consolidation order.
    pub const ALL: [Domain; 9] = [
        Domain::Apm,
        Domain::Browser,
        Domain::Infra,
        Domain::Db,
        Domain::Mobile,
        Domain::Iot,
        Domain::Serverless,
        Domain::Synth,
        Domain::Ext,
    ];

    /// Upstream domains that never hold instrumented entities.
    pub const IGNORED: [&'static str; 8] = [
        "AIOPS",
        "VIZ",
        "UNINSTRUMENTED",
        "UNKNOWN",
        "DASHBOARD",
        "ALERT",
        "WORKLOAD",
        "INSIGHTS",
    ];

    /// Upstream spelling of the domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Apm => "APM",
            Domain::Browser => "BROWSER",
            Domain::Infra => "INFRA",
            Domain::Db => "DB",
            Domain::Mobile => "MOBILE",
            Domain::Iot => "IOT",
            Domain::Serverless => "SERVERLESS",
            Domain::Synth => "SYNTH",
            Domain::Ext => "EXT",
        }
    }

    /// Whether an upstream domain string is one we deliberately skip.
    pub fn is_ignored(raw: &str) -> bool {
        let raw = raw.trim();
        Self::IGNORED.iter().any(|d| d.eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = NervaError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| NervaError::config(format!("Unknown domain: {s}")))
    }
}

/// Time window a metric set was collected over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Period {
    /// Last 30 minutes
    #[serde(rename = "30min")]
    Minutes30,
    /// Last 24 hours
    #[serde(rename = "24h")]
    Hours24,
    /// Last 7 days
    #[serde(rename = "7d")]
    Days7,
    /// Last 30 days
    #[serde(rename = "30d")]
    Days30,
}

impl Period {
    /// Label used as the key in an entity's metric map.
    pub fn label(&self) -> &'static str {
        match self {
            Period::Minutes30 => "30min",
            Period::Hours24 => "24h",
            Period::Days7 => "7d",
            Period::Days30 => "30d",
        }
    }

    /// NRQL `SINCE` clause for the window.
    pub fn since_clause(&self) -> &'static str {
        match self {
            Period::Minutes30 => "SINCE 30 MINUTES AGO",
            Period::Hours24 => "SINCE 24 HOURS AGO",
            Period::Days7 => "SINCE 7 DAYS AGO",
            Period::Days30 => "SINCE 30 DAYS AGO",
        }
    }
}

/// Metric name to collected value (scalar, list of records or nested object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSet(BTreeMap<String, Value>);

impl MetricSet {
    /// Create an empty metric set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a metric value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// Look up a metric value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Number of metrics in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no metrics at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over metric names and values.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Iterate mutably over metric values.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.0.values_mut()
    }
}

impl FromIterator<(String, Value)> for MetricSet {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One monitored resource tracked by the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Upstream GUID, the deduplication key
    #[serde(rename = "guid")]
    pub id: String,
    /// Display label
    #[serde(default)]
    pub name: String,
    /// Domain the entity belongs to
    pub domain: Domain,
    /// Upstream entity type
    #[serde(rename = "entityType", default)]
    pub kind: String,
    /// Period label to metric set
    #[serde(rename = "metricas", default)]
    pub metrics: BTreeMap<String, MetricSet>,
    /// Filled with synthetic or fallback values rather than collected data
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tainted: bool,
}

impl Entity {
    /// Create an entity with no metrics.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        domain: Domain,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain,
            kind: kind.into(),
            metrics: BTreeMap::new(),
            tainted: false,
        }
    }

    /// Attach a metric set for a period, replacing any previous one.
    pub fn with_period(mut self, period: impl Into<String>, metrics: MetricSet) -> Self {
        self.metrics.insert(period.into(), metrics);
        self
    }

    /// Whether the entity carries a usable dedup key.
    pub fn has_id(&self) -> bool {
        !self.id.trim().is_empty()
    }
}
