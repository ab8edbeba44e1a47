//! NRQL metric queries collected for each domain.

use crate::core::{Domain, Period};
use crate::upstream::nrql_literal;

/// One named metric and the NRQL that fetches it.
#[derive(Debug, Clone, Copy)]
pub struct MetricTemplate {
    /// Key under which the result is stored in the metric set
    pub name: &'static str,
    select: &'static str,
    from: &'static str,
    limit: Option<u32>,
}

impl MetricTemplate {
    const fn new(name: &'static str, select: &'static str, from: &'static str) -> Self {
        Self {
            name,
            select,
            from,
            limit: None,
        }
    }

    const fn limited(self, limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    /// NRQL for one entity over one period.
    pub fn render(&self, guid: &str, period: Period) -> String {
        let mut nrql = format!(
            "SELECT {} FROM {} WHERE entity.guid = {} {}",
            self.select,
            self.from,
            nrql_literal(guid),
            period.since_clause()
        );
        if let Some(limit) = self.limit {
            nrql.push_str(&format!(" LIMIT {limit}"));
        }
        nrql
    }
}

const APM: &[MetricTemplate] = &[
    MetricTemplate::new("apdex", "apdexScore AS score", "Metric"),
    MetricTemplate::new("response_time_max", "max(duration) AS max_duration", "Transaction"),
    MetricTemplate::new("error_rate", "latest(errorRate) AS error_rate", "Metric"),
    MetricTemplate::new(
        "recent_error",
        "count(*), error.message, error.class, httpResponseCode",
        "TransactionError",
    )
    .limited(10),
    MetricTemplate::new("throughput", "average(newRelic.throughput) AS avg_qps", "Metric"),
];

const BROWSER: &[MetricTemplate] = &[
    MetricTemplate::new("apdex", "apdexScore AS score", "Metric"),
    MetricTemplate::new("page_load_time", "average(pageLoadTime) AS avg_load_time", "PageView"),
    MetricTemplate::new(
        "js_errors",
        "count(*) AS error_count, errorMessage",
        "JavaScriptError",
    )
    .limited(10),
];

const INFRA: &[MetricTemplate] = &[
    MetricTemplate::new("cpu_usage", "average(cpuPercent) AS avg_cpu", "Metric"),
    MetricTemplate::new(
        "memory_usage",
        "average(memoryUsedBytes) / average(memoryTotalBytes) * 100 AS memory_percent",
        "Metric",
    ),
    MetricTemplate::new("disk_usage", "average(diskUsedPercent) AS disk_percent", "Metric"),
];

const GENERIC: &[MetricTemplate] = &[MetricTemplate::new("generic", "*", "Metric").limited(10)];

/// Metrics collected for entities of `domain`.
pub fn templates(domain: Domain) -> &'static [MetricTemplate] {
    match domain {
        Domain::Apm => APM,
        Domain::Browser => BROWSER,
        Domain::Infra => INFRA,
        _ => GENERIC,
    }
}
