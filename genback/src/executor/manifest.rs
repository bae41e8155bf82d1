//! Metadata snapshots.
//!
//! Every backup run writes one snapshot into each archive directory it visits,
//! recording the directory's own metadata, every file it holds (with the stored
//! blob name when encrypted) and the subdirectories it recursed into. Snapshots
//! are immutable; the newest one is the reference for the next run.

use crate::fs::{FileMeta, FileSystemProvider};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

pub const SNAPSHOT_PREFIX: &str = ".genback-meta-";
pub const SNAPSHOT_SUFFIX: &str = ".json";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

const STAMP_DIGITS: usize = 17;

/// Snapshot of one directory, serialized as `.genback-meta-{stamp}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub timestamp: DateTime<Utc>,

    /// Metadata of the source directory itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<FileMeta>,

    /// Ordered by name
    #[serde(default)]
    pub files: Vec<FileEntry>,

    /// Subdirectories the run recursed into, ordered
    #[serde(default)]
    pub subdirectories: Vec<String>,
}

/// Metadata for a single file in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,

    /// Blob name when the content is stored encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_name: Option<String>,

    /// Physical size of the encrypted blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_size: Option<u64>,

    /// `algo:hex` digest of the plaintext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    pub meta: FileMeta,
}

impl FileEntry {
    /// Name of the blob holding this file's content in the archive directory.
    pub fn blob_name(&self) -> &str {
        self.stored_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_encrypted(&self) -> bool {
        self.stored_name.is_some()
    }
}

impl Snapshot {
    /// Case-insensitive lookup.
    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        let wanted = fold(name);
        self.files.iter().find(|e| fold(&e.name) == wanted)
    }

    /// Lookup table keyed by case-folded name, for classifying a whole directory.
    pub fn index(&self) -> HashMap<String, &FileEntry> {
        self.files.iter().map(|e| (fold(&e.name), e)).collect()
    }
}

pub(crate) fn fold(name: &str) -> String {
    name.to_lowercase()
}

/// Collects the entries of a snapshot from concurrently running file tasks.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    entries: Mutex<BTreeMap<String, FileEntry>>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; a name that differs from an existing one only by case is rejected.
    pub fn insert(&self, entry: FileEntry) -> Result<()> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = fold(&entry.name);
        if entries.contains_key(&key) {
            return Err(EngineError::DuplicateEntry(entry.name));
        }
        entries.insert(key, entry);
        Ok(())
    }

    pub fn finish(
        &self,
        timestamp: DateTime<Utc>,
        directory: Option<FileMeta>,
        mut subdirectories: Vec<String>,
    ) -> Snapshot {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut files: Vec<FileEntry> = entries.values().cloned().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        subdirectories.sort();

        Snapshot {
            version: FORMAT_VERSION,
            timestamp,
            directory,
            files,
            subdirectories,
        }
    }
}

/// The timestamp encoded in a qualifying snapshot file name.
pub fn snapshot_stamp(name: &str) -> Option<&str> {
    let body = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(SNAPSHOT_SUFFIX)?;
    if body.len() == STAMP_DIGITS && body.bytes().all(|b| b.is_ascii_digit()) {
        Some(body)
    } else {
        None
    }
}

pub fn is_snapshot_name(name: &str) -> bool {
    snapshot_stamp(name).is_some()
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let seconds = NaiveDateTime::parse_from_str(stamp.get(..14)?, "%Y%m%d%H%M%S").ok()?;
    let millis: i64 = stamp.get(14..)?.parse().ok()?;
    Some(seconds.and_utc() + Duration::milliseconds(millis))
}

pub fn snapshot_name(timestamp: DateTime<Utc>) -> String {
    format!(
        "{}{}{:03}{}",
        SNAPSHOT_PREFIX,
        timestamp.format("%Y%m%d%H%M%S"),
        timestamp.timestamp_subsec_millis().min(999),
        SNAPSHOT_SUFFIX
    )
}

fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = timestamp.timestamp_subsec_nanos() % 1_000_000;
    timestamp - Duration::nanoseconds(i64::from(nanos))
}

/// Name for a new snapshot written at `now`. When the newest existing snapshot is
/// not older than `now`, the new one is placed one millisecond after it so that it
/// still sorts last.
pub fn next_snapshot_name(latest_existing: Option<&str>, now: DateTime<Utc>) -> String {
    let now = truncate_to_millis(now);
    let latest = latest_existing.and_then(snapshot_stamp).and_then(parse_stamp);
    match latest {
        Some(latest) if latest >= now => snapshot_name(latest + Duration::milliseconds(1)),
        _ => snapshot_name(now),
    }
}

/// Qualifying snapshot names in `dir`, newest first. A missing directory has none.
async fn snapshot_names(fs: &dyn FileSystemProvider, dir: &Path) -> Result<Vec<String>> {
    let entries = match fs.list(dir).await {
        Ok(entries) => entries,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names: Vec<String> = entries
        .into_iter()
        .filter(|e| e.is_file() && is_snapshot_name(&e.name))
        .map(|e| e.name)
        .collect();
    names.sort_by(|a, b| b.cmp(a));
    Ok(names)
}

/// Load the newest readable snapshot of `dir`.
///
/// With `strict`, a newest snapshot that cannot be read or parsed is an error.
/// Otherwise older snapshots are tried in turn, and `None` is returned when none parse.
pub async fn latest_snapshot(
    fs: &dyn FileSystemProvider,
    dir: &Path,
    strict: bool,
) -> Result<Option<Snapshot>> {
    for name in snapshot_names(fs, dir).await? {
        let path = dir.join(&name);
        let parsed = match fs.read_to_string(&path).await {
            Ok(text) => serde_json::from_str::<Snapshot>(&text).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match parsed {
            Ok(snapshot) => {
                debug!(path = %path.display(), files = snapshot.files.len(), "Loaded snapshot");
                return Ok(Some(snapshot));
            }
            Err(reason) if strict => return Err(EngineError::CorruptSnapshot { path, reason }),
            Err(reason) => {
                warn!("Ignoring unreadable snapshot {}: {}", path.display(), reason);
            }
        }
    }
    Ok(None)
}

/// Write `snapshot` to a fresh name in `dir`. Returns the name used.
pub async fn write_snapshot(
    fs: &dyn FileSystemProvider,
    dir: &Path,
    snapshot: &Snapshot,
) -> Result<String> {
    let existing = snapshot_names(fs, dir).await?;
    let name = next_snapshot_name(existing.first().map(String::as_str), snapshot.timestamp);
    let json = serde_json::to_vec_pretty(snapshot)?;
    fs.write_atomic(&dir.join(&name), &json).await?;
    if let Err(e) = fs.set_hidden(&dir.join(&name)).await {
        debug!("Could not hide snapshot {}: {}", name, e);
    }
    Ok(name)
}
