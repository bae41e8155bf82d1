//! Historical names for displaced files.
//!
//! Before a file is overwritten, the existing copy is renamed out of the way:
//! archive blobs become `.old.{name}.{yyyymmdd}.{seq}` (plus `.genc` when the
//! blob was encrypted), restored files become `.original.{name}.{seq}.original`.
//! The sequence is the smallest free one starting at 1. Picking a name and
//! renaming happen under one lock per directory so that concurrent tasks never
//! pick the same name.

use crate::crypto::{is_encrypted_name, ENCRYPTED_SUFFIX};
use crate::fs::FileSystemProvider;
use crate::utils::errors::{EngineError, Result};
use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

pub const BACKUP_HISTORY_PREFIX: &str = ".old.";
pub const RESTORE_HISTORY_PREFIX: &str = ".original.";
const RESTORE_HISTORY_SUFFIX: &str = ".original";
const MAX_SEQUENCE: u32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    /// An archive blob superseded by a newer backup
    Backup,
    /// A local file about to be overwritten by a restore
    Restore,
}

pub fn backup_history_name(name: &str, date: NaiveDate, seq: u32, encrypted: bool) -> String {
    format!(
        "{}{}.{}.{:04}{}",
        BACKUP_HISTORY_PREFIX,
        name,
        date.format("%Y%m%d"),
        seq,
        if encrypted { ENCRYPTED_SUFFIX } else { "" }
    )
}

pub fn restore_history_name(name: &str, seq: u32) -> String {
    format!("{}{}.{:04}{}", RESTORE_HISTORY_PREFIX, name, seq, RESTORE_HISTORY_SUFFIX)
}

pub fn is_backup_history_name(name: &str) -> bool {
    name.starts_with(BACKUP_HISTORY_PREFIX)
}

/// One per directory batch.
#[derive(Debug, Default)]
pub struct HistoryNamer {
    lock: Mutex<()>,
}

impl HistoryNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename `dir/blob` to the next free historical name for `name`.
    ///
    /// Returns the new path, or `None` when there was nothing to displace.
    pub async fn displace(
        &self,
        fs: &dyn FileSystemProvider,
        dir: &Path,
        name: &str,
        blob: &str,
        kind: HistoryKind,
    ) -> Result<Option<PathBuf>> {
        let _guard = self.lock.lock().await;

        let current = dir.join(blob);
        if !fs.exists(&current).await? {
            return Ok(None);
        }

        let today = Local::now().date_naive();
        let encrypted = is_encrypted_name(blob);
        for seq in 1..=MAX_SEQUENCE {
            let candidate = dir.join(match kind {
                HistoryKind::Backup => backup_history_name(name, today, seq, encrypted),
                HistoryKind::Restore => restore_history_name(name, seq),
            });
            if fs.exists(&candidate).await? {
                continue;
            }

            fs.rename(&current, &candidate).await?;
            if let Err(e) = fs.set_hidden(&candidate).await {
                debug!("Could not hide {}: {}", candidate.display(), e);
            }
            return Ok(Some(candidate));
        }

        Err(EngineError::HistoryExhausted(current.display().to_string()))
    }
}
