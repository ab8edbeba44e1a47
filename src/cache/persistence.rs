//! Durable snapshot file: atomic writes and corruption-tolerant reads.

use crate::cache::snapshot::{CacheSnapshot, SnapshotSource};
use crate::core::{Domain, Entity, NervaError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const GENERATOR: &str = concat!("nerva/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct CacheFileOut<'a> {
    timestamp: DateTime<Utc>,
    entities: &'a [Entity],
    source: SnapshotSource,
    domain_counts: BTreeMap<Domain, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback_reason: Option<&'a str>,
    generator: &'static str,
}

#[derive(Deserialize)]
struct CacheFileIn {
    timestamp: String,
    entities: Vec<Value>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    last_check: Option<String>,
    #[serde(default)]
    fallback_reason: Option<String>,
}

/// Serialize a snapshot, stamped with `timestamp`, to the cache file format.
pub fn encode(snapshot: &CacheSnapshot, timestamp: DateTime<Utc>) -> Result<Vec<u8>> {
    let file = CacheFileOut {
        timestamp,
        entities: &snapshot.entities,
        source: snapshot.source,
        domain_counts: snapshot.domain_counts(),
        last_check: snapshot.last_check,
        fallback_reason: snapshot.fallback_reason.as_deref(),
        generator: GENERATOR,
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

/// Parse cache file contents.
///
/// Fails with `CacheCorrupt` when the document lacks a parseable timestamp
/// or an entity list. Individual entities that do not parse are skipped.
/// A snapshot written as a fallback loads as one; anything else loads as
/// [`SnapshotSource::Disk`].
pub fn decode(bytes: &[u8]) -> Result<CacheSnapshot> {
    let file: CacheFileIn = serde_json::from_slice(bytes)
        .map_err(|e| NervaError::CacheCorrupt(e.to_string()))?;

    let generated_at = parse_timestamp(&file.timestamp).ok_or_else(|| {
        NervaError::CacheCorrupt(format!("unreadable timestamp '{}'", file.timestamp))
    })?;

    let total = file.entities.len();
    let entities: Vec<Entity> = file
        .entities
        .into_iter()
        .filter_map(|raw| serde_json::from_value(raw).ok())
        .collect();
    if entities.len() < total {
        warn!(
            skipped = total - entities.len(),
            "Skipped unreadable entities in cache file"
        );
    }

    let mut snapshot = CacheSnapshot::from_entities(entities);
    snapshot.generated_at = Some(generated_at);
    snapshot.source = match file.source.as_deref() {
        Some("fallback") => SnapshotSource::Fallback,
        _ => SnapshotSource::Disk,
    };
    snapshot.last_check = file.last_check.as_deref().and_then(parse_timestamp);
    snapshot.fallback_reason = file.fallback_reason;
    Ok(snapshot)
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Sibling temp file used for atomic replacement.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `bytes` to `path` via a fsynced temp file and rename.
///
/// The previous file is left intact on failure and the temp file removed.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            NervaError::storage(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }

    let tmp = tmp_path(path);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(NervaError::storage(format!(
            "Failed to write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

/// Read the cache file. Missing files yield `Ok(None)`.
pub async fn read(path: &Path) -> Result<Option<CacheSnapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(NervaError::CacheCorrupt(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}
