//! Run-wide counters shared by every file task.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    copy_files: AtomicU64,
    copy_bytes: AtomicU64,
    recovered_files: AtomicU64,
    skip_files: AtomicU64,
    skip_bytes: AtomicU64,
    error_files: AtomicU64,
    cancelled_files: AtomicU64,
    verified_files: AtomicU64,
    dirs_created: AtomicU64,
    dirs_skipped: AtomicU64,
    dirs_errored: AtomicU64,
    sync_deleted_files: AtomicU64,
    sync_deleted_dirs: AtomicU64,
    sync_delete_failures: AtomicU64,
}

/// Point-in-time copy of `Stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub copy_files: u64,
    pub copy_bytes: u64,
    pub recovered_files: u64,
    pub skip_files: u64,
    pub skip_bytes: u64,
    pub error_files: u64,
    pub cancelled_files: u64,
    pub verified_files: u64,
    pub dirs_created: u64,
    pub dirs_skipped: u64,
    pub dirs_errored: u64,
    pub sync_deleted_files: u64,
    pub sync_deleted_dirs: u64,
    pub sync_delete_failures: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A completed copy. Copies that needed a retry count as recovered instead.
    pub fn copied(&self, bytes: u64, recovered: bool) {
        if recovered {
            bump(&self.recovered_files, 1);
        } else {
            bump(&self.copy_files, 1);
        }
        bump(&self.copy_bytes, bytes);
    }

    pub fn skipped(&self, bytes: u64) {
        bump(&self.skip_files, 1);
        bump(&self.skip_bytes, bytes);
    }

    pub fn errored(&self) {
        bump(&self.error_files, 1);
    }

    pub fn cancelled(&self) {
        bump(&self.cancelled_files, 1);
    }

    pub fn verified(&self) {
        bump(&self.verified_files, 1);
    }

    pub fn dir_created(&self) {
        bump(&self.dirs_created, 1);
    }

    pub fn dir_skipped(&self) {
        bump(&self.dirs_skipped, 1);
    }

    pub fn dir_errored(&self) {
        bump(&self.dirs_errored, 1);
    }

    pub fn sync_deleted_file(&self) {
        bump(&self.sync_deleted_files, 1);
    }

    pub fn sync_deleted_dir(&self) {
        bump(&self.sync_deleted_dirs, 1);
    }

    pub fn sync_delete_failed(&self) {
        bump(&self.sync_delete_failures, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            copy_files: load(&self.copy_files),
            copy_bytes: load(&self.copy_bytes),
            recovered_files: load(&self.recovered_files),
            skip_files: load(&self.skip_files),
            skip_bytes: load(&self.skip_bytes),
            error_files: load(&self.error_files),
            cancelled_files: load(&self.cancelled_files),
            verified_files: load(&self.verified_files),
            dirs_created: load(&self.dirs_created),
            dirs_skipped: load(&self.dirs_skipped),
            dirs_errored: load(&self.dirs_errored),
            sync_deleted_files: load(&self.sync_deleted_files),
            sync_deleted_dirs: load(&self.sync_deleted_dirs),
            sync_delete_failures: load(&self.sync_delete_failures),
        }
    }
}

impl StatsSnapshot {
    /// Any file, directory or sync-delete failure.
    pub fn has_errors(&self) -> bool {
        self.error_files > 0 || self.dirs_errored > 0 || self.sync_delete_failures > 0
    }

    /// One-line human summary for the console.
    pub fn summary(&self) -> String {
        format!(
            "{} copied ({}), {} recovered, {} skipped ({}), {} verified, {} errors, {} cancelled",
            self.copy_files,
            format_bytes(self.copy_bytes),
            self.recovered_files,
            self.skip_files,
            format_bytes(self.skip_bytes),
            self.verified_files,
            self.error_files,
            self.cancelled_files,
        )
    }
}

/// Stable `Key=Value` rendering written to the error log when a run ends.
impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Copy_NumFiles={} Copy_Bytes={} Recovered_NumFiles={} Skip_NumFiles={} Skip_Bytes={} \
             Error_NumFiles={} Cancelled_NumFiles={} Verified_NumFiles={} \
             Dir_Created={} Dir_Skipped={} Dir_Errored={} \
             SyncDelete_NumFiles={} SyncDelete_NumDirs={} SyncDelete_Failures={}",
            self.copy_files,
            self.copy_bytes,
            self.recovered_files,
            self.skip_files,
            self.skip_bytes,
            self.error_files,
            self.cancelled_files,
            self.verified_files,
            self.dirs_created,
            self.dirs_skipped,
            self.dirs_errored,
            self.sync_deleted_files,
            self.sync_deleted_dirs,
            self.sync_delete_failures,
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
