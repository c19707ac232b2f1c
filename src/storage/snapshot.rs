//! Single-file JSON snapshot of all durable state.
//!
//! Loading never fails: each top-level field (and each element of the item
//! and job lists) is decoded on its own, and anything malformed is replaced
//! by its default. Writes go through a temp file and an atomic rename so a
//! crash mid-write leaves the previous snapshot intact.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::{Feed, FeedKind, Library, StoreError};
use crate::sync::{Job, JobQueue, RateLimitState};

/// Current on-disk format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything the engine persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub feeds: BTreeMap<FeedKind, Feed>,
    pub jobs: JobQueue,
    pub next_job_id: u64,
    pub rate_limit: RateLimitState,
    pub library: Library,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            feeds: BTreeMap::new(),
            jobs: JobQueue::default(),
            next_job_id: 1,
            rate_limit: RateLimitState::default(),
            library: Library::default(),
        }
    }
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode leniently. Returns `None` only when the payload is not a JSON
    /// object at all.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(bytes) else {
            return None;
        };

        let version: u32 = field(&mut map, "version");
        if version > SNAPSHOT_VERSION {
            tracing::warn!(
                version = version,
                supported = SNAPSHOT_VERSION,
                "State file written by a newer version, reading what is understood"
            );
        }

        let jobs: Vec<Job> = list(map.remove("jobs"), "jobs");
        let mut snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            feeds: decode_feeds(map.remove("feeds")),
            jobs: JobQueue::from_jobs(jobs),
            next_job_id: field(&mut map, "next_job_id"),
            rate_limit: field(&mut map, "rate_limit"),
            library: decode_library(map.remove("library")),
        };

        // Never hand out an id that is already in the queue.
        let max_id = snapshot.jobs.jobs().iter().map(|j| j.id).max().unwrap_or(0);
        snapshot.next_job_id = snapshot.next_job_id.max(max_id + 1);
        Some(snapshot)
    }
}

fn field<T: DeserializeOwned + Default>(map: &mut Map<String, Value>, key: &str) -> T {
    match map.remove(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::warn!(field = key, error = %e, "Corrupt field in state file, using default");
            T::default()
        }),
    }
}

/// Decode a list element by element, dropping the ones that do not parse.
fn list<T: DeserializeOwned>(value: Option<Value>, what: &str) -> Vec<T> {
    let values = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(values)) => values,
        Some(_) => {
            tracing::warn!(field = what, "Expected a list in state file, using empty");
            return Vec::new();
        }
    };

    let total = values.len();
    let decoded: Vec<T> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    if decoded.len() < total {
        tracing::warn!(
            field = what,
            dropped = total - decoded.len(),
            "Dropped malformed entries from state file"
        );
    }
    decoded
}

fn decode_feed(value: Value) -> Feed {
    let Value::Object(mut map) = value else {
        return Feed::default();
    };
    Feed {
        items: list(map.remove("items"), "items"),
        pending: list(map.remove("pending"), "pending"),
        last_fetch: field(&mut map, "last_fetch"),
    }
}

fn decode_feeds(value: Option<Value>) -> BTreeMap<FeedKind, Feed> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(key, value)| {
            match serde_json::from_value::<FeedKind>(Value::String(key.clone())) {
                Ok(kind) => Some((kind, decode_feed(value))),
                Err(_) => {
                    tracing::warn!(feed = %key, "Unknown feed in state file, skipping");
                    None
                }
            }
        })
        .collect()
}

fn decode_library(value: Option<Value>) -> Library {
    let Some(Value::Object(mut map)) = value else {
        return Library::default();
    };
    Library {
        subscriptions: field(&mut map, "subscriptions"),
        blocked_sources: field(&mut map, "blocked_sources"),
        blocked_authors: field(&mut map, "blocked_authors"),
        pinned: list(map.remove("pinned"), "pinned"),
    }
}

// ============================================================================
// PersistentStore
// ============================================================================

/// Reads and writes the snapshot file. No other code touches its bytes.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, falling back to defaults for anything unreadable.
    ///
    /// A file that is not a JSON object at all is moved aside to
    /// `<name>.corrupt-<timestamp>` so the next save does not destroy it.
    pub fn load(&self) -> Snapshot {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No state file, starting empty");
                return Snapshot::default();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read state file, starting empty");
                return Snapshot::default();
            }
        };

        if let Some(snapshot) = Snapshot::decode(&bytes) {
            tracing::debug!(
                path = %self.path.display(),
                bytes = bytes.len(),
                jobs = snapshot.jobs.len(),
                "Loaded state"
            );
            return snapshot;
        }

        let backup = self.path.with_extension(format!(
            "json.corrupt-{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        match std::fs::rename(&self.path, &backup) {
            Ok(()) => tracing::warn!(
                path = %self.path.display(),
                backup = %backup.display(),
                "State file is corrupt, moved aside and starting empty"
            ),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "State file is corrupt and could not be moved aside, starting empty"
            ),
        }
        Snapshot::default()
    }

    /// Atomically replace the state file with `bytes`.
    pub fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        Ok(write_atomic(&self.path, bytes)?)
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<u64, StoreError> {
        let bytes = snapshot.encode()?;
        self.write(&bytes)?;
        Ok(bytes.len() as u64)
    }
}

/// Write `bytes` to a private temp file next to `path`, then rename over it.
///
/// Readers see either the old content or the new, never a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let suffix = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let temp_path = path.with_extension(format!("tmp.{:016x}", suffix));

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = options.open(&temp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    #[cfg(windows)]
    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    }

    if let Err(e) = std::fs::rename(&temp_path, &path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

impl StoreError {
    /// Whether the failure means "no room", which eviction can fix.
    pub fn is_storage_full(&self) -> bool {
        match self {
            StoreError::StorageFull { .. } => true,
            StoreError::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
            StoreError::Serialize(_) => false,
        }
    }
}
