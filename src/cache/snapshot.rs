//! Immutable consolidated view of all collected entities.

use crate::core::{Domain, Entity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::warn;

/// Where the served snapshot came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Built from a successful collection run
    Live,
    /// Previous data kept after an insufficient run
    Fallback,
    /// Loaded from the durable cache file
    Disk,
    /// Nothing collected yet
    #[default]
    Empty,
}

/// Deduplicated entities plus a per-domain index.
///
/// Snapshots are never mutated once published; every change builds a new one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    /// Unique by id, in merge order
    pub entities: Vec<Entity>,
    /// Domain to ordered entity ids
    pub per_domain_index: BTreeMap<Domain, Vec<String>>,
    /// Id to position in `entities`
    positions: HashMap<String, usize>,
    /// When the data was last successfully consolidated
    pub generated_at: Option<DateTime<Utc>>,
    pub source: SnapshotSource,
    /// Last refresh attempt that decided to keep this snapshot
    pub last_check: Option<DateTime<Utc>>,
    pub fallback_reason: Option<String>,
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge per-domain lists into one snapshot.
    ///
    /// Domains are visited in [`Domain`] order and entities in list order.
    /// The first occurrence of an id wins; entities without an id are
    /// dropped.
    pub fn consolidate<I>(per_domain: I) -> Self
    where
        I: IntoIterator<Item = (Domain, Vec<Entity>)>,
    {
        let mut grouped: BTreeMap<Domain, Vec<Entity>> = BTreeMap::new();
        for (domain, entities) in per_domain {
            grouped.entry(domain).or_default().extend(entities);
        }

        let mut positions = HashMap::new();
        let mut entities = Vec::new();
        let mut per_domain_index: BTreeMap<Domain, Vec<String>> = BTreeMap::new();
        let mut skipped_no_id = 0usize;
        let mut duplicates = 0usize;

        for (domain, list) in grouped {
            for entity in list {
                if !entity.has_id() {
                    skipped_no_id += 1;
                    continue;
                }
                if positions.contains_key(&entity.id) {
                    duplicates += 1;
                    continue;
                }
                positions.insert(entity.id.clone(), entities.len());
                per_domain_index
                    .entry(domain)
                    .or_default()
                    .push(entity.id.clone());
                entities.push(entity);
            }
        }

        if skipped_no_id > 0 {
            warn!(skipped = skipped_no_id, "Dropped entities without an id during consolidation");
        }
        if duplicates > 0 {
            tracing::debug!(duplicates, "Collapsed duplicate entities during consolidation");
        }

        Self {
            entities,
            per_domain_index,
            positions,
            generated_at: Some(Utc::now()),
            source: SnapshotSource::Live,
            last_check: None,
            fallback_reason: None,
        }
    }

    /// Consolidate a flat list, grouping entities by their own domain.
    pub fn from_entities(entities: Vec<Entity>) -> Self {
        let mut grouped: BTreeMap<Domain, Vec<Entity>> = BTreeMap::new();
        for entity in entities {
            grouped.entry(entity.domain).or_default().push(entity);
        }
        Self::consolidate(grouped)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up an entity by id.
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.positions.get(id).and_then(|&at| self.entities.get(at))
    }

    /// Entities indexed under `domain`, in index order.
    pub fn domain_entities(&self, domain: Domain) -> Vec<&Entity> {
        self.per_domain_index
            .get(&domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn domain_counts(&self) -> BTreeMap<Domain, usize> {
        self.per_domain_index
            .iter()
            .map(|(domain, ids)| (*domain, ids.len()))
            .collect()
    }

    pub fn tainted_count(&self) -> usize {
        self.entities.iter().filter(|e| e.tainted).count()
    }

    /// Time since `generated_at`, if known.
    pub fn age(&self) -> Option<Duration> {
        self.generated_at
            .map(|at| (Utc::now() - at).to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether the snapshot is older than `max_age` or has no timestamp.
    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.age().map_or(true, |age| age > max_age)
    }
}
