//! File metadata recorded in snapshots and re-applied on restore.
//!
//! This module preserves file metadata (permissions, timestamps, ownership)
//! for accurate restoration.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Complete file metadata for backup/restore operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File size in bytes
    pub size: u64,

    /// Last write time
    pub modified: DateTime<Utc>,

    /// Last access time (never compared, too noisy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed: Option<DateTime<Utc>>,

    /// Creation time, where the platform reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// Permission bits (Unix mode & 0o7777)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    #[serde(default)]
    pub readonly: bool,

    /// Security descriptor: owning user and group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,

    /// Transparent file system compression flag
    #[serde(default)]
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Which parts of a `FileMeta` to write back. Timestamps are always written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataScope {
    pub attributes: bool,
    pub security: bool,
}

impl MetadataScope {
    pub const TIMES: MetadataScope = MetadataScope {
        attributes: false,
        security: false,
    };
}

impl FileMeta {
    /// Extract metadata from a `std::fs::Metadata`
    pub fn from_std(metadata: &fs::Metadata) -> Self {
        let modified = metadata
            .modified()
            .map(to_utc)
            .unwrap_or_else(|_| to_utc(SystemTime::UNIX_EPOCH));

        #[cfg(unix)]
        let (mode, owner) = {
            use std::os::unix::fs::MetadataExt;
            (
                Some(metadata.mode() & 0o7777),
                Some(Owner {
                    uid: metadata.uid(),
                    gid: metadata.gid(),
                }),
            )
        };

        #[cfg(not(unix))]
        let (mode, owner) = (None, None);

        Self {
            size: metadata.len(),
            modified,
            accessed: metadata.accessed().ok().map(to_utc),
            created: metadata.created().ok().map(to_utc),
            mode,
            readonly: metadata.permissions().readonly(),
            owner,
            compressed: false,
        }
    }

    /// Extract metadata from a file path (follows symlinks)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_std(&fs::metadata(path)?))
    }

    /// Structural equality used by verify: creation and last-access times and the
    /// security descriptor are excluded.
    pub fn same_structure(&self, other: &FileMeta) -> bool {
        self.size == other.size
            && self.modified == other.modified
            && self.mode == other.mode
            && self.readonly == other.readonly
            && self.compressed == other.compressed
    }

    /// Last write times within `tolerance` of each other.
    pub fn modified_within(&self, other: &FileMeta, tolerance: Duration) -> bool {
        let delta = if self.modified >= other.modified {
            self.modified - other.modified
        } else {
            other.modified - self.modified
        };
        delta
            .to_std()
            .map(|d| d <= tolerance)
            .unwrap_or(false)
    }
}

pub fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

pub fn to_filetime(time: &DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos())
}

/// Apply this metadata to a path. Timestamps first, then ownership, then permissions,
/// so a read-only mode never blocks the earlier steps.
pub fn apply_to_path(path: &Path, meta: &FileMeta, scope: MetadataScope) -> std::io::Result<()> {
    let mtime = to_filetime(&meta.modified);
    let atime = meta.accessed.as_ref().map(to_filetime).unwrap_or(mtime);
    filetime::set_file_times(path, atime, mtime)?;

    #[cfg(unix)]
    {
        if scope.security {
            if let Some(owner) = meta.owner {
                std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))?;
            }
        }
        if scope.attributes {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = meta.mode {
                fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if scope.attributes {
            let mut perms = fs::metadata(path)?.permissions();
            if perms.readonly() != meta.readonly {
                perms.set_readonly(meta.readonly);
                fs::set_permissions(path, perms)?;
            }
        }
    }

    Ok(())
}
