//! Restore: replay archive snapshots onto a local tree.

use super::history::{HistoryKind, HistoryNamer};
use super::manifest::{latest_snapshot, FileEntry};
use super::{RestorePolicy, RunContext};
use crate::fs::{FileMeta, MetadataScope};
use crate::transfer::digest::HashAlgorithm;
use crate::transfer::{contents_equal, copy_file, CopyOptions, Transform};
use crate::utils::errors::{describe, EngineError, Result};
use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct RestoreJob {
    archive_dir: PathBuf,
    local_dir: PathBuf,
    entry: FileEntry,
    history: Arc<HistoryNamer>,
}

/// Whether a local file should be replaced by its archived version, before any
/// content comparison. `None` means sizes and times agree and only the content
/// can decide.
fn decide(policy: RestorePolicy, recorded: &FileMeta, current: Option<&FileMeta>) -> Option<bool> {
    let Some(current) = current else {
        return Some(true);
    };
    match policy {
        RestorePolicy::OnlyNewer => Some(recorded.modified > current.modified),
        RestorePolicy::AlwaysOverwrite => Some(true),
        RestorePolicy::Default => {
            if recorded.size != current.size || recorded.modified != current.modified {
                Some(true)
            } else {
                None
            }
        }
    }
}

fn scope_of(ctx: &RunContext) -> MetadataScope {
    MetadataScope {
        attributes: ctx.options.copy_attributes,
        security: ctx.options.copy_security,
    }
}

/// Restore one archive directory and everything below it.
pub(crate) fn restore_dir(
    ctx: Arc<RunContext>,
    archive: PathBuf,
    local: PathBuf,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let snapshot = latest_snapshot(&*ctx.archive, &archive, true)
            .await?
            .ok_or_else(|| EngineError::MissingSnapshot(archive.clone()))?;

        ensure_local_dir(&ctx, &local, snapshot.directory.as_ref()).await?;
        stamp_dir(&ctx, &local, snapshot.directory.as_ref(), MetadataScope::TIMES).await;

        let history = Arc::new(HistoryNamer::new());
        let jobs: Vec<_> = snapshot
            .files
            .iter()
            .map(|entry| {
                (
                    local.join(&entry.name),
                    RestoreJob {
                        archive_dir: archive.clone(),
                        local_dir: local.clone(),
                        entry: entry.clone(),
                        history: Arc::clone(&history),
                    },
                )
            })
            .collect();

        debug!(dir = %archive.display(), files = jobs.len(), "Restoring directory");
        ctx.fan_out(jobs, restore_file).await;
        stamp_dir(&ctx, &local, snapshot.directory.as_ref(), MetadataScope::TIMES).await;

        for sub in &snapshot.subdirectories {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if ctx.is_ignored(sub) {
                continue;
            }
            let child_archive = archive.join(sub);
            let child = restore_dir(Arc::clone(&ctx), child_archive.clone(), local.join(sub));
            if let Err(e) = child.await {
                if e.is_cancelled() {
                    break;
                }
                ctx.record_dir_error(&child_archive, &e);
            }
        }

        stamp_dir(&ctx, &local, snapshot.directory.as_ref(), scope_of(&ctx)).await;
        Ok(())
    })
}

async fn ensure_local_dir(
    ctx: &RunContext,
    local: &Path,
    recorded: Option<&FileMeta>,
) -> Result<()> {
    if ctx.local.exists(local).await? {
        ctx.stats.dir_skipped();
        return Ok(());
    }

    let compressed = recorded.map(|m| m.compressed).unwrap_or(false);
    let mut created = ctx.local.create_dir(local, compressed).await;
    if created.is_err() && compressed {
        created = ctx.local.create_dir(local, false).await;
    }
    if let Err(e) = created {
        // Another writer may have created it in the meantime
        if !ctx.local.exists(local).await? {
            return Err(e);
        }
    }
    ctx.stats.dir_created();
    Ok(())
}

async fn stamp_dir(
    ctx: &RunContext,
    local: &Path,
    recorded: Option<&FileMeta>,
    scope: MetadataScope,
) {
    let Some(meta) = recorded else {
        return;
    };
    if let Err(e) = ctx.local.set_metadata(local, meta, scope).await {
        debug!("Could not stamp {}: {}", local.display(), e);
    }
}

async fn restore_file(ctx: Arc<RunContext>, job: RestoreJob) -> Result<()> {
    let RestoreJob {
        archive_dir,
        local_dir,
        entry,
        history,
    } = job;

    let target = local_dir.join(&entry.name);
    let blob = archive_dir.join(entry.blob_name());
    let cipher = if entry.is_encrypted() {
        Some(ctx.cipher.clone().ok_or_else(|| {
            EngineError::Crypto(format!(
                "{} is encrypted and no password was given",
                blob.display()
            ))
        })?)
    } else {
        None
    };

    let current = ctx.local.metadata(&target).await?;
    let restore = match decide(ctx.options.restore_policy, &entry.meta, current.as_ref()) {
        Some(restore) => restore,
        None => !ctx
            .options
            .retry
            .run(&ctx.cancel, || {
                contents_equal(
                    &*ctx.local,
                    &target,
                    &*ctx.archive,
                    &blob,
                    cipher.as_deref(),
                    &ctx.cancel,
                )
            })
            .await?
            .value,
    };

    if !restore {
        ctx.stats.skipped(entry.meta.size);
        return Ok(());
    }

    let displaced = if current.is_some() {
        history
            .displace(&*ctx.local, &local_dir, &entry.name, &entry.name, HistoryKind::Restore)
            .await?
    } else {
        None
    };

    let expected = entry
        .content_hash
        .as_deref()
        .filter(|_| ctx.options.verify_restored_hash);
    let opts = CopyOptions {
        transform: match &cipher {
            Some(cipher) => Transform::Decrypt {
                cipher: Arc::clone(cipher),
            },
            None => Transform::None,
        },
        verify_after_write: false,
        hash: expected.and_then(HashAlgorithm::of_digest),
    };

    let attempted = ctx
        .options
        .retry
        .run(&ctx.cancel, || async {
            let outcome =
                copy_file(&*ctx.archive, &blob, &*ctx.local, &target, &opts, &ctx.cancel).await?;
            if let (Some(expected), Some(actual)) = (expected, outcome.digest.as_deref()) {
                if expected != actual {
                    return Err(EngineError::HashMismatch {
                        path: target.clone(),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
            Ok(outcome)
        })
        .await?;

    ctx.stats.copied(attempted.value.plain_bytes, attempted.recovered());
    ctx.log.info(&[
        "Restored",
        &target.display().to_string(),
        &attempted.value.plain_bytes.to_string(),
    ]);
    if attempted.recovered() {
        info!("Recovered {} after {} attempts", target.display(), attempted.attempts);
    }

    if let Err(e) = ctx.local.set_metadata(&target, &entry.meta, scope_of(&ctx)).await {
        if entry.meta.readonly {
            debug!("Metadata not applied to read-only {}: {}", target.display(), e);
        } else {
            ctx.log
                .error(&["MetadataNotApplied", &target.display().to_string(), &describe(&e)]);
        }
    }

    if !ctx.options.keep_history {
        if let Some(old) = displaced {
            if let Err(e) = ctx.local.remove_file(&old).await {
                warn!("Could not remove replaced file {}: {}", old.display(), e);
            }
        }
    }
    Ok(())
}
