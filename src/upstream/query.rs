//! Query documents sent to the upstream GraphQL endpoint and their results.

use crate::core::{Domain, NervaError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static SELECT_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bselect\b").expect("valid SELECT regex"));

/// GraphQL error markers the upstream uses for rate limiting.
const RATE_LIMIT_MARKERS: [&str; 2] = ["TOO_MANY_REQUESTS", "NRDB:1106924"];

/// One upstream query, scoped to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// NRQL statement executed through `actor.account.nrql`
    Nrql {
        /// Account the statement runs against
        account_id: String,
        /// Statement text
        text: String,
    },
    /// Entity search restricted to one domain
    EntitySearch {
        /// Account the search runs against
        account_id: String,
        /// Domain to search
        domain: Domain,
    },
}

impl Query {
    /// Build an NRQL query.
    pub fn nrql(account_id: impl Into<String>, text: impl Into<String>) -> Self {
        Query::Nrql {
            account_id: account_id.into(),
            text: text.into(),
        }
    }

    /// Build a domain-scoped entity search.
    pub fn entity_search(account_id: impl Into<String>, domain: Domain) -> Self {
        Query::EntitySearch {
            account_id: account_id.into(),
            domain,
        }
    }

    /// The query-language text, before GraphQL wrapping.
    pub fn text(&self) -> String {
        match self {
            Query::Nrql { text, .. } => text.clone(),
            Query::EntitySearch { account_id, domain } => {
                format!("accountId = {account_id} AND domain = '{domain}'")
            },
        }
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        let text = self.text();
        match text.char_indices().nth(100) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text,
        }
    }

    /// Structural checks run before anything is sent.
    pub fn validate(&self, max_length: usize) -> Result<()> {
        let text = self.text();

        if text.chars().count() > max_length {
            return Err(NervaError::invalid_query(format!(
                "query is {} characters, limit is {}",
                text.chars().count(),
                max_length
            )));
        }

        match self {
            Query::Nrql { account_id, text } => {
                if !SELECT_KEYWORD.is_match(text) {
                    return Err(NervaError::invalid_query(format!(
                        "NRQL is missing a SELECT clause: {}",
                        self.describe()
                    )));
                }
                if text.contains("\"\"\"") {
                    return Err(NervaError::invalid_query(
                        "NRQL must not contain a triple quote",
                    ));
                }
                validate_account(account_id)
            },
            Query::EntitySearch { account_id, .. } => validate_account(account_id),
        }
    }

    /// Render the GraphQL document for the request body.
    pub fn render(&self) -> String {
        match self {
            Query::Nrql { account_id, text } => format!(
                "{{ actor {{ account(id: {account_id}) {{ nrql(query: \"\"\"{text}\"\"\") {{ results }} }} }} }}"
            ),
            Query::EntitySearch { .. } => format!(
                "{{ actor {{ entitySearch(query: \"{}\") {{ results {{ entities {{ guid name domain entityType reporting }} }} count }} }} }}",
                self.text()
            ),
        }
    }

    /// Interpret a 2xx response body.
    ///
    /// An empty result list is a successful query with no data. GraphQL
    /// errors and bodies without the expected result path are failures.
    pub fn parse_response(&self, body: &str) -> Result<Vec<Value>> {
        let mut document: Value = serde_json::from_str(body)
            .map_err(|e| NervaError::malformed(format!("response is not JSON: {e}")))?;

        if let Some(errors) = document.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let message = document["errors"].to_string();
                if RATE_LIMIT_MARKERS.iter().any(|marker| message.contains(marker)) {
                    return Err(NervaError::RateLimited(message));
                }
                return Err(NervaError::QueryRejected(message));
            }
        }

        let pointer = match self {
            Query::Nrql { .. } => "/data/actor/account/nrql/results",
            Query::EntitySearch { .. } => "/data/actor/entitySearch/results/entities",
        };

        match document.pointer_mut(pointer).map(Value::take) {
            Some(Value::Array(rows)) => Ok(rows),
            Some(other) => Err(NervaError::malformed(format!(
                "expected a result list at '{pointer}', got {}",
                type_name(&other)
            ))),
            None => Err(NervaError::malformed(format!("response is missing '{pointer}'"))),
        }
    }
}

/// Quote a value for use inside an NRQL single-quoted literal.
pub fn nrql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn validate_account(account_id: &str) -> Result<()> {
    if account_id.is_empty() || !account_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(NervaError::invalid_query(format!(
            "account id must be numeric, got '{account_id}'"
        )));
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
