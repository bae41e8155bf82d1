//! Backup: mirror a local tree into the archive, one snapshot per directory.

use super::history::{is_backup_history_name, HistoryKind, HistoryNamer};
use super::manifest::{
    fold, is_snapshot_name, latest_snapshot, write_snapshot, FileEntry, Snapshot, SnapshotBuilder,
};
use super::RunContext;
use crate::crypto::{stored_name, ENCRYPTED_SUFFIX};
use crate::fs::{DirEntry, FileMeta, MetadataScope};
use crate::transfer::{copy_file, CopyOptions, Transform};
use crate::utils::errors::{describe, EngineError, Result};
use chrono::Utc;
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Without a snapshot, an unencrypted blob whose time is this close to the
/// source's counts as unchanged.
const MTIME_TOLERANCE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    Changed,
}

/// What is known about a file from the previous run.
#[derive(Debug, Clone, Copy)]
pub enum Prior<'a> {
    /// The archive directory has no readable snapshot
    NoSnapshot,
    /// The snapshot's entry for this file, if any
    Entry(Option<&'a FileEntry>),
}

/// Decide whether `source` needs to be copied. `stored` is the blob name the
/// current run would use and `blob` the metadata of that blob in the archive.
pub fn classify(
    source: &FileMeta,
    stored: &str,
    encrypting: bool,
    prior: Prior<'_>,
    blob: Option<&FileMeta>,
) -> Change {
    let Some(blob) = blob else {
        return Change::Changed;
    };

    let unchanged = match prior {
        Prior::NoSnapshot => {
            !encrypting && blob.size == source.size && blob.modified_within(source, MTIME_TOLERANCE)
        }
        Prior::Entry(None) => false,
        Prior::Entry(Some(entry)) => {
            let recorded_matches =
                entry.meta.size == source.size && entry.meta.modified == source.modified;
            if entry.blob_name() != stored {
                false
            } else if encrypting {
                entry.stored_size == Some(blob.size) && recorded_matches
            } else {
                recorded_matches && blob.size == source.size
            }
        }
    };

    if unchanged {
        Change::Unchanged
    } else {
        Change::Changed
    }
}

struct FileJob {
    source_dir: PathBuf,
    archive_dir: PathBuf,
    entry: DirEntry,
    previous: Option<FileEntry>,
    change: Change,
    builder: Arc<SnapshotBuilder>,
    history: Arc<HistoryNamer>,
}

/// Back up one directory and everything below it.
///
/// Errors confined to this directory are recorded and swallowed; only fatal and
/// cancellation errors, or a failure to set the directory up, reach the caller.
pub(crate) fn backup_dir(
    ctx: Arc<RunContext>,
    source: PathBuf,
    archive: PathBuf,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let source_meta = ctx
            .local
            .metadata(&source)
            .await?
            .ok_or_else(|| EngineError::DirectoryNotFound(source.clone()))?;

        ensure_archive_dir(&ctx, &archive, &source_meta).await?;

        let body = backup_body(&ctx, &source, &archive, &source_meta).await;

        if let Err(e) = ctx
            .archive
            .set_metadata(&archive, &source_meta, MetadataScope::TIMES)
            .await
        {
            debug!("Could not restamp {}: {}", archive.display(), e);
        }

        body
    })
}

async fn ensure_archive_dir(
    ctx: &RunContext,
    archive: &Path,
    source_meta: &FileMeta,
) -> Result<()> {
    if ctx.archive.exists(archive).await? {
        ctx.stats.dir_skipped();
        return Ok(());
    }

    if let Err(e) = ctx.archive.create_dir(archive, source_meta.compressed).await {
        if !source_meta.compressed {
            return Err(e);
        }
        debug!("Compressed create failed for {}, retrying plain: {}", archive.display(), e);
        ctx.archive.create_dir(archive, false).await?;
    }
    ctx.stats.dir_created();

    if let Err(e) = ctx
        .archive
        .set_metadata(archive, source_meta, MetadataScope::TIMES)
        .await
    {
        debug!("Could not stamp {}: {}", archive.display(), e);
    }
    Ok(())
}

async fn backup_body(
    ctx: &Arc<RunContext>,
    source: &Path,
    archive: &Path,
    source_meta: &FileMeta,
) -> Result<()> {
    let previous = latest_snapshot(&*ctx.archive, archive, false).await?;
    let source_entries = ctx.local.list(source).await?;
    let blobs: HashMap<String, FileMeta> = ctx
        .archive
        .list(archive)
        .await?
        .into_iter()
        .filter(|e| e.is_file())
        .map(|e| (e.name, e.meta))
        .collect();

    let encrypting = ctx.cipher.is_some();
    let index = previous.as_ref().map(Snapshot::index);
    let builder = Arc::new(SnapshotBuilder::new());
    let history = Arc::new(HistoryNamer::new());

    let mut jobs = Vec::new();
    let mut subdirs = Vec::new();
    let mut claimed = HashSet::new();
    let mut collisions = 0;
    for entry in source_entries {
        if !ctx.admits(&entry) {
            debug!("Skipping symlink {}", source.join(&entry.name).display());
            continue;
        }
        if entry.is_dir() {
            if !ctx.is_ignored(&entry.name) {
                subdirs.push(entry.name);
            }
            continue;
        }

        // Names are unique per snapshot ignoring case; the first in listing order wins
        if !claimed.insert(fold(&entry.name)) {
            let path = source.join(&entry.name);
            ctx.record_file_error(&path, &EngineError::DuplicateEntry(entry.name));
            collisions += 1;
            continue;
        }

        let stored = stored_name(&entry.name, encrypting);
        let found = index.as_ref().map(|idx| idx.get(&fold(&entry.name)).copied());
        let prior = match found {
            None => Prior::NoSnapshot,
            Some(e) => Prior::Entry(e),
        };
        let change = classify(&entry.meta, &stored, encrypting, prior, blobs.get(&stored));

        jobs.push((
            source.join(&entry.name),
            FileJob {
                source_dir: source.to_path_buf(),
                archive_dir: archive.to_path_buf(),
                previous: found.flatten().cloned(),
                entry,
                change,
                builder: Arc::clone(&builder),
                history: Arc::clone(&history),
            },
        ));
    }

    debug!(
        dir = %source.display(),
        files = jobs.len(),
        subdirs = subdirs.len(),
        "Processing directory"
    );
    let batch = ctx.fan_out(jobs, backup_file).await;
    let mut had_error = batch.failed > 0 || collisions > 0;

    // Written even after file errors or cancellation
    let snapshot = builder.finish(Utc::now(), Some(source_meta.clone()), subdirs.clone());
    let name = write_snapshot(&*ctx.archive, archive, &snapshot).await?;
    debug!(dir = %archive.display(), %name, entries = snapshot.files.len(), "Snapshot written");

    for sub in &subdirs {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let (child_source, child_archive) = (source.join(sub), archive.join(sub));
        if let Err(e) = backup_dir(Arc::clone(ctx), child_source.clone(), child_archive).await {
            if e.is_cancelled() {
                return Ok(());
            }
            had_error = true;
            ctx.record_dir_error(&child_source, &e);
        }
    }

    if ctx.options.sync && !had_error && !ctx.cancel.is_cancelled() {
        sync_delete(ctx, source, archive).await?;
    }
    Ok(())
}

async fn backup_file(ctx: Arc<RunContext>, job: FileJob) -> Result<()> {
    let FileJob {
        source_dir,
        archive_dir,
        entry,
        previous,
        change,
        builder,
        history,
    } = job;

    let encrypting = ctx.cipher.is_some();
    let stored = stored_name(&entry.name, encrypting);
    let source_path = source_dir.join(&entry.name);
    let blob_path = archive_dir.join(&stored);

    if change == Change::Unchanged {
        if let Err(e) = ctx
            .archive
            .set_metadata(&blob_path, &entry.meta, MetadataScope::TIMES)
            .await
        {
            debug!("Could not restamp {}: {}", blob_path.display(), e);
        }
        ctx.stats.skipped(entry.meta.size);
        return builder.insert(FileEntry {
            name: entry.name,
            stored_name: encrypting.then_some(stored),
            stored_size: previous.as_ref().and_then(|p| p.stored_size),
            content_hash: previous.and_then(|p| p.content_hash),
            meta: entry.meta,
        });
    }

    let displaced = history
        .displace(&*ctx.archive, &archive_dir, &entry.name, &stored, HistoryKind::Backup)
        .await?;

    let opts = CopyOptions {
        transform: match (&ctx.cipher, &ctx.options.encryption) {
            (Some(cipher), Some(enc)) => Transform::Encrypt {
                cipher: Arc::clone(cipher),
                compress: enc.compress,
            },
            _ => Transform::None,
        },
        verify_after_write: ctx.options.verify_after_write,
        hash: ctx.options.hash,
    };

    let attempted = ctx
        .options
        .retry
        .run(&ctx.cancel, || async {
            let outcome = copy_file(
                &*ctx.local,
                &source_path,
                &*ctx.archive,
                &blob_path,
                &opts,
                &ctx.cancel,
            )
            .await?;
            ctx.archive
                .set_metadata(&blob_path, &entry.meta, MetadataScope::TIMES)
                .await?;
            Ok(outcome)
        })
        .await?;
    let recovered = attempted.recovered();
    let attempts = attempted.attempts;
    let outcome = attempted.value;

    ctx.stats.copied(outcome.plain_bytes, recovered);
    ctx.log.info(&[
        "Copied",
        &source_path.display().to_string(),
        &outcome.plain_bytes.to_string(),
    ]);
    if recovered {
        info!("Recovered {} after {} attempts", source_path.display(), attempts);
    }

    if !ctx.options.keep_history {
        if let Some(old) = displaced {
            if let Err(e) = ctx.archive.remove_file(&old).await {
                warn!("Could not remove superseded blob {}: {}", old.display(), e);
            }
        }
    }

    builder.insert(FileEntry {
        name: entry.name,
        stored_name: encrypting.then_some(stored),
        stored_size: encrypting.then_some(outcome.stored_bytes),
        content_hash: outcome.digest,
        meta: entry.meta,
    })
}

/// Delete archive items whose source no longer exists.
async fn sync_delete(ctx: &RunContext, source: &Path, archive: &Path) -> Result<()> {
    let live: HashSet<String> = ctx
        .local
        .list(source)
        .await?
        .into_iter()
        .map(|e| fold(&e.name))
        .collect();

    for item in ctx.archive.list(archive).await? {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if is_snapshot_name(&item.name) {
            continue;
        }
        if ctx.options.keep_history && is_backup_history_name(&item.name) {
            continue;
        }

        let key = fold(&item.name);
        let plain_key = key.strip_suffix(ENCRYPTED_SUFFIX).filter(|k| !k.is_empty());
        if live.contains(&key) || plain_key.map(|k| live.contains(k)).unwrap_or(false) {
            continue;
        }

        let path = archive.join(&item.name);
        let removed = if item.is_dir() {
            ctx.archive.remove_dir(&path).await
        } else {
            ctx.archive.remove_file(&path).await
        };
        match removed {
            Ok(()) => {
                if item.is_dir() {
                    ctx.stats.sync_deleted_dir();
                } else {
                    ctx.stats.sync_deleted_file();
                }
                ctx.log.info(&["Deleted", &path.display().to_string()]);
            }
            Err(e) => {
                ctx.stats.sync_delete_failed();
                ctx.log
                    .error(&["SyncDeleteFailed", &path.display().to_string(), &describe(&e)]);
            }
        }
    }
    Ok(())
}
