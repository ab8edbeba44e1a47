//! Consolidation cache: the in-memory snapshot served to readers and its
//! durable copy on disk.
//!
//! Readers get an `Arc` to an immutable [`CacheSnapshot`]. Writers build a
//! complete replacement off to the side and publish it with a single atomic
//! swap, so a read never observes a half-merged state and never waits on a
//! write in progress.

pub mod persistence;
pub mod refresh;
pub mod snapshot;

use crate::core::config::CacheConfig;
use crate::core::{Domain, Entity, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use refresh::{CacheRefresher, RefreshOutcome};
pub use snapshot::{CacheSnapshot, SnapshotSource};

/// Cache statistics for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entity_count: usize,
    pub domain_counts: BTreeMap<Domain, usize>,
    pub tainted_count: usize,
    pub source: SnapshotSource,
    pub generated_at: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    /// Age in seconds
    pub age_secs: Option<u64>,
    pub stale: bool,
    pub fallback_reason: Option<String>,
}

/// Holds the live snapshot and its durable copy.
pub struct ConsolidationCache {
    current: ArcSwap<CacheSnapshot>,
    path: PathBuf,
    max_age: Duration,
    persist_lock: tokio::sync::Mutex<()>,
}

impl ConsolidationCache {
    /// Create an empty cache backed by `config.path`.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(CacheSnapshot::empty()),
            path: config.path.clone(),
            max_age: config.max_age,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot currently served.
    pub fn read(&self) -> Arc<CacheSnapshot> {
        self.current.load_full()
    }

    /// Consolidate per-domain lists and publish the result.
    pub fn merge<I>(&self, per_domain: I) -> Arc<CacheSnapshot>
    where
        I: IntoIterator<Item = (Domain, Vec<Entity>)>,
    {
        let snapshot = Arc::new(CacheSnapshot::consolidate(per_domain));
        self.current.store(Arc::clone(&snapshot));
        info!(
            entities = snapshot.len(),
            domains = snapshot.per_domain_index.len(),
            "Published consolidated snapshot"
        );
        snapshot
    }

    /// Publish an already built snapshot.
    pub fn install(&self, snapshot: CacheSnapshot) -> Arc<CacheSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }

    /// Write `snapshot` to disk under its consolidation time.
    ///
    /// A snapshot without `generated_at` is stamped with the current time;
    /// the stamped copy replaces the live snapshot only if `snapshot` is
    /// still the one being served. Timestamps already present are kept, so a
    /// fallback snapshot keeps the age of the data it carries.
    pub async fn persist(&self, snapshot: &Arc<CacheSnapshot>) -> Result<Arc<CacheSnapshot>> {
        let _guard = self.persist_lock.lock().await;

        let generated_at = snapshot.generated_at.unwrap_or_else(Utc::now);
        let bytes = persistence::encode(snapshot, generated_at)?;
        persistence::write_atomic(&self.path, &bytes).await?;

        let stamped = if snapshot.generated_at.is_some() {
            Arc::clone(snapshot)
        } else {
            let mut stamped = CacheSnapshot::clone(snapshot);
            stamped.generated_at = Some(generated_at);
            let stamped = Arc::new(stamped);

            let previous = self.current.compare_and_swap(snapshot, Arc::clone(&stamped));
            if !Arc::ptr_eq(&*previous, snapshot) {
                debug!("Live snapshot changed during persist, keeping the newer one");
            }
            stamped
        };

        info!(
            path = %self.path.display(),
            entities = stamped.len(),
            bytes = bytes.len(),
            "Persisted cache snapshot"
        );
        Ok(stamped)
    }

    /// Read the durable copy. Unreadable files are logged and ignored.
    pub async fn load(&self) -> Option<CacheSnapshot> {
        match persistence::read(&self.path).await {
            Ok(Some(snapshot)) => {
                debug!(path = %self.path.display(), entities = snapshot.len(), "Loaded cache file");
                Some(snapshot)
            },
            Ok(None) => {
                debug!(path = %self.path.display(), "No cache file found");
                None
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unusable cache file");
                None
            },
        }
    }

    /// Install the durable copy at startup if it is not expired.
    pub async fn restore(&self) -> Option<Arc<CacheSnapshot>> {
        let snapshot = self.load().await?;

        if snapshot.is_expired(self.max_age) {
            info!(
                age = ?snapshot.age(),
                max_age = ?self.max_age,
                "Cache file is expired, starting empty"
            );
            return None;
        }

        info!(entities = snapshot.len(), "Restored cache from disk");
        Some(self.install(snapshot))
    }

    /// Whether the served data should be recollected.
    ///
    /// True when empty, expired, or kept only as a fallback.
    pub fn needs_refresh(&self) -> bool {
        let snapshot = self.read();
        snapshot.is_empty()
            || snapshot.is_expired(self.max_age)
            || snapshot.source == SnapshotSource::Fallback
    }

    pub fn stats(&self) -> CacheStats {
        let snapshot = self.read();
        CacheStats {
            entity_count: snapshot.len(),
            domain_counts: snapshot.domain_counts(),
            tainted_count: snapshot.tainted_count(),
            source: snapshot.source,
            generated_at: snapshot.generated_at,
            last_check: snapshot.last_check,
            age_secs: snapshot.age().map(|age| age.as_secs()),
            stale: snapshot.is_expired(self.max_age),
            fallback_reason: snapshot.fallback_reason.clone(),
        }
    }
}
