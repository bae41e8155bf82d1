//! Verify: audit a local tree against the archive without modifying either side.

use super::manifest::{fold, latest_snapshot, FileEntry};
use super::RunContext;
use crate::fs::DirEntry;
use crate::transfer::contents_equal;
use crate::utils::errors::{EngineError, Result};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

struct VerifyJob {
    local_dir: PathBuf,
    archive_dir: PathBuf,
    file: DirEntry,
    recorded: Option<FileEntry>,
}

pub(crate) fn verify_dir(
    ctx: Arc<RunContext>,
    local: PathBuf,
    archive: PathBuf,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let snapshot = latest_snapshot(&*ctx.archive, &archive, true)
            .await?
            .ok_or_else(|| EngineError::MissingSnapshot(archive.clone()))?;

        let entries = match ctx.local.list(&local).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Err(EngineError::DirectoryNotFound(local.clone())),
            Err(e) => return Err(e),
        };

        let mut recorded: HashMap<String, FileEntry> = snapshot
            .files
            .into_iter()
            .map(|e| (fold(&e.name), e))
            .collect();

        let mut jobs = Vec::new();
        let mut subdirs = Vec::new();
        for entry in entries {
            if !ctx.admits(&entry) {
                continue;
            }
            if entry.is_dir() {
                if !ctx.is_ignored(&entry.name) {
                    subdirs.push(entry.name);
                }
                continue;
            }
            jobs.push((
                local.join(&entry.name),
                VerifyJob {
                    local_dir: local.clone(),
                    archive_dir: archive.clone(),
                    recorded: recorded.remove(&fold(&entry.name)),
                    file: entry,
                },
            ));
        }

        debug!(dir = %local.display(), files = jobs.len(), "Verifying directory");
        ctx.fan_out(jobs, verify_file).await;

        for sub in subdirs {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let child_local = local.join(&sub);
            let child = verify_dir(Arc::clone(&ctx), child_local.clone(), archive.join(&sub));
            if let Err(e) = child.await {
                if e.is_cancelled() {
                    break;
                }
                ctx.record_dir_error(&child_local, &e);
            }
        }
        Ok(())
    })
}

async fn verify_file(ctx: Arc<RunContext>, job: VerifyJob) -> Result<()> {
    let VerifyJob {
        local_dir,
        archive_dir,
        file,
        recorded,
    } = job;
    let path = local_dir.join(&file.name);

    let recorded = recorded.ok_or_else(|| EngineError::NotInSnapshot(path.clone()))?;

    if !ctx.options.verify_skip_metadata && !file.meta.same_structure(&recorded.meta) {
        debug!(
            path = %path.display(),
            local = ?file.meta,
            recorded = ?recorded.meta,
            "Metadata differs"
        );
        return Err(EngineError::MetadataMismatch(path));
    }

    let cipher = if recorded.is_encrypted() {
        Some(ctx.cipher.clone().ok_or_else(|| {
            EngineError::Crypto(format!(
                "{} is stored encrypted and no password was given",
                path.display()
            ))
        })?)
    } else {
        None
    };

    let blob = archive_dir.join(recorded.blob_name());
    let equal = ctx
        .options
        .retry
        .run(&ctx.cancel, || {
            contents_equal(&*ctx.local, &path, &*ctx.archive, &blob, cipher.as_deref(), &ctx.cancel)
        })
        .await?
        .value;
    if !equal {
        return Err(EngineError::ContentMismatch(path));
    }

    ctx.stats.verified();
    Ok(())
}
