use crate::cache::{older_than, DehydratedQuery, QueryCache};
use crate::error::LiftError;
use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const SNAPSHOT_KEY: &str = "liftsync.query-cache";
pub const SNAPSHOT_VERSION: u64 = 1;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub version: u64,
    pub entries: Vec<DehydratedQuery>,
    pub written_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Malformed(String),
    #[error("snapshot has no version field")]
    MissingVersion,
    #[error("snapshot version {0} is not supported")]
    UnsupportedVersion(u64),
}

pub fn encode_snapshot(
    entries: Vec<DehydratedQuery>,
    now: DateTime<Utc>,
) -> Result<Vec<u8>, LiftError> {
    let snapshot = PersistedSnapshot {
        version: SNAPSHOT_VERSION,
        entries,
        written_at: now,
    };
    Ok(serde_json::to_vec(&snapshot)?)
}

/// Parse a stored snapshot. Snapshots without a known version are rejected
/// as a whole; individual entries with unknown key shapes are skipped.
pub fn decode_snapshot(bytes: &[u8]) -> Result<PersistedSnapshot, SnapshotError> {
    let raw: Value =
        serde_json::from_slice(bytes).map_err(|err| SnapshotError::Malformed(err.to_string()))?;
    let version = match raw.get("version") {
        None | Some(Value::Null) => return Err(SnapshotError::MissingVersion),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| SnapshotError::Malformed(format!("invalid version {value}")))?,
    };
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let written_at = raw
        .get("writtenAt")
        .cloned()
        .and_then(|value| serde_json::from_value::<DateTime<Utc>>(value).ok())
        .ok_or_else(|| SnapshotError::Malformed("missing writtenAt".to_string()))?;
    let entries = match raw.get("entries") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match serde_json::from_value::<DehydratedQuery>(item.clone()) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::debug!(%err, "skipping unreadable snapshot entry");
                    None
                }
            })
            .collect(),
        _ => return Err(SnapshotError::Malformed("missing entries".to_string())),
    };
    Ok(PersistedSnapshot {
        version,
        entries,
        written_at,
    })
}

/// Seed `cache` from the stored snapshot. Entries older than `max_age` are
/// treated as misses. Returns the number of entries restored.
pub async fn restore(cache: &QueryCache, store: &dyn KeyValueStore, max_age: Duration) -> usize {
    let bytes = match store.get(SNAPSHOT_KEY).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return 0,
        Err(err) => {
            tracing::warn!(%err, "failed to read persisted query cache");
            return 0;
        }
    };
    let snapshot = match decode_snapshot(&bytes) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(%err, "discarding persisted query cache");
            return 0;
        }
    };
    let now = cache.now();
    let total = snapshot.entries.len();
    let fresh: Vec<DehydratedQuery> = snapshot
        .entries
        .into_iter()
        .filter(|entry| !older_than(entry.fetched_at, now, max_age))
        .collect();
    if fresh.len() < total {
        tracing::debug!(dropped = total - fresh.len(), "dropped expired snapshot entries");
    }
    let restored = cache.hydrate(fresh);
    tracing::info!(restored, "restored query cache");
    restored
}

async fn write_snapshot(
    cache: &QueryCache,
    store: &dyn KeyValueStore,
    max_age: Duration,
) -> Result<usize, LiftError> {
    let now = cache.now();
    let entries: Vec<DehydratedQuery> = cache
        .dehydrate()
        .into_iter()
        .filter(|entry| !older_than(entry.fetched_at, now, max_age))
        .collect();
    let count = entries.len();
    let bytes = encode_snapshot(entries, now)?;
    store.set(SNAPSHOT_KEY, &bytes).await?;
    Ok(count)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOptions {
    pub max_age: Duration,
    pub debounce: Duration,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Background writer that mirrors the cache into durable storage.
pub struct CachePersister {
    cache: QueryCache,
    store: Arc<dyn KeyValueStore>,
    options: PersistOptions,
    task: JoinHandle<()>,
}

impl CachePersister {
    /// Start mirroring. Each cache change re-arms the debounce timer, so a
    /// burst of changes produces a single write once it settles.
    pub fn spawn(
        cache: QueryCache,
        store: Arc<dyn KeyValueStore>,
        options: PersistOptions,
    ) -> Self {
        let task = {
            let cache = cache.clone();
            let store = store.clone();
            let options = options.clone();
            let mut changes = cache.subscribe_changes();
            tokio::spawn(async move {
                while changes.changed().await.is_ok() {
                    loop {
                        match timeout(options.debounce, changes.changed()).await {
                            Ok(Ok(())) => continue,
                            Ok(Err(_)) => return,
                            Err(_) => break,
                        }
                    }
                    match write_snapshot(&cache, store.as_ref(), options.max_age).await {
                        Ok(count) => tracing::debug!(count, "persisted query cache"),
                        Err(err) => tracing::warn!(%err, "failed to persist query cache"),
                    }
                }
            })
        };
        Self {
            cache,
            store,
            options,
            task,
        }
    }

    /// Write the current cache immediately.
    pub async fn flush(&self) -> Result<usize, LiftError> {
        write_snapshot(&self.cache, self.store.as_ref(), self.options.max_age).await
    }

    /// Stop the background writer after a final flush.
    pub async fn shutdown(self) {
        self.task.abort();
        if let Err(err) = self.flush().await {
            tracing::warn!(%err, "final query cache flush failed");
        }
    }
}

impl Drop for CachePersister {
    fn drop(&mut self) {
        self.task.abort();
    }
}
