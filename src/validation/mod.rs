//! Entity validity policy and metric value normalization.

use crate::core::{Entity, MetricSet};
use serde_json::Value;
use tracing::{info, warn};

pub use crate::core::ValidationMode;

/// Rejection rate above which a filter pass is reported as suspicious.
const REJECTION_WARN_RATIO: f64 = 0.5;

/// Replace JSON-encoded strings with the structure they encode.
///
/// A string whose trimmed text starts with `{` or `[` and parses as JSON is
/// replaced by the parsed value. When strict parsing fails, single quotes are
/// swapped for double quotes and parsing is tried once more. Lists and
/// objects are normalized recursively. Applying this twice is a no-op.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    return normalize_value(parsed);
                }
                if let Ok(parsed) = serde_json::from_str::<Value>(&trimmed.replace('\'', "\"")) {
                    return normalize_value(parsed);
                }
            }
            Value::String(text)
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, normalize_value(value)))
                .collect(),
        ),
        other => other,
    }
}

/// Whether a value carries real data.
///
/// Null, blank strings and empty containers do not. A container counts only
/// if one of its elements does, so `[{"score": null}]` is not substantive.
/// Numbers (including zero) and booleans always are.
pub fn is_substantive(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(_) | Value::Number(_) => true,
        Value::String(text) => !text.trim().is_empty(),
        Value::Array(items) => items.iter().any(is_substantive),
        Value::Object(fields) => fields.values().any(is_substantive),
    }
}

/// Whether any metric in the set carries real data.
pub fn metric_set_is_substantive(metrics: &MetricSet) -> bool {
    metrics.iter().any(|(_, value)| is_substantive(value))
}

/// Normalize every metric value of an entity in place.
pub fn normalize_entity(entity: &mut Entity) {
    for metrics in entity.metrics.values_mut() {
        for value in metrics.values_mut() {
            *value = normalize_value(value.take());
        }
    }
}

/// Decides which collected entities are worth serving.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityValidator {
    mode: ValidationMode,
}

impl EntityValidator {
    pub fn new(mode: ValidationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Relaxed mode needs a name; rigorous mode also needs one substantive
    /// metric set.
    pub fn is_valid(&self, entity: &Entity) -> bool {
        if entity.name.trim().is_empty() {
            return false;
        }

        match self.mode {
            ValidationMode::Relaxed => true,
            ValidationMode::Rigorous => entity.metrics.values().any(metric_set_is_substantive),
        }
    }

    /// Normalize then keep only valid entities, preserving order.
    pub fn filter(&self, entities: Vec<Entity>) -> Vec<Entity> {
        let processed = entities.len();

        let valid: Vec<Entity> = entities
            .into_iter()
            .map(|mut entity| {
                normalize_entity(&mut entity);
                entity
            })
            .filter(|entity| self.is_valid(entity))
            .collect();

        let rejected = processed - valid.len();
        info!(
            processed,
            valid = valid.len(),
            rejected,
            mode = ?self.mode,
            "Entity filter complete"
        );

        if processed > 0 && rejected as f64 / processed as f64 > REJECTION_WARN_RATIO {
            warn!(
                processed,
                rejected,
                "More than half of the collected entities were rejected"
            );
        }

        valid
    }
}
