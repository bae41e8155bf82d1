//! Backup, restore and verify executor.
//!
//! An `Engine` runs one operation at a time over a pair of directories on two
//! providers. Directories are walked depth-first and sequentially; inside a
//! directory the file list is fanned out to a bounded worker pool and the
//! directory stage waits for the whole batch before it moves on.

pub mod backup;
pub mod history;
pub mod manifest;
pub mod restore;
pub mod verify;

use crate::crypto::{CipherSuite, KdfParams};
use crate::fs::{DirEntry, FileSystemProvider};
use crate::transfer::{HashAlgorithm, Stats, StatsSnapshot};
use crate::utils::errors::{describe, EngineError, Result};
use crate::utils::logger::RunLog;
use crate::utils::retry::RetryPolicy;
use manifest::fold;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Worker pool bounds
const MIN_POOL_SIZE: usize = 8;
const MAX_POOL_SIZE: usize = 128;

/// When an existing local file is replaced during restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    /// Restore when size, time or content differ
    #[default]
    Default,
    /// Restore only when the recorded time is strictly newer
    OnlyNewer,
    AlwaysOverwrite,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptionOptions {
    pub password: String,

    /// zstd-compress before encrypting
    #[serde(default = "default_true")]
    pub compress: bool,

    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,

    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_true() -> bool {
    true
}

fn default_kdf_memory_kib() -> u32 {
    KdfParams::default().memory_kib
}

fn default_kdf_iterations() -> u32 {
    KdfParams::default().iterations
}

impl EncryptionOptions {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            compress: true,
            kdf_memory_kib: default_kdf_memory_kib(),
            kdf_iterations: default_kdf_iterations(),
        }
    }

    pub fn kdf(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf_memory_kib,
            iterations: self.kdf_iterations,
        }
    }
}

impl fmt::Debug for EncryptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionOptions")
            .field("password", &"<redacted>")
            .field("compress", &self.compress)
            .field("kdf_memory_kib", &self.kdf_memory_kib)
            .field("kdf_iterations", &self.kdf_iterations)
            .finish()
    }
}

/// Engine behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Keep superseded archive blobs (and replaced local files) as history
    pub keep_history: bool,

    /// Delete archive items that no longer exist in the source
    pub sync: bool,

    pub verify_after_write: bool,

    /// Record a content digest for every copied file
    pub hash: Option<HashAlgorithm>,

    pub encryption: Option<EncryptionOptions>,

    pub follow_symlinks: bool,

    pub restore_policy: RestorePolicy,

    /// Re-apply permission bits on restore
    pub copy_attributes: bool,

    /// Re-apply ownership on restore
    pub copy_security: bool,

    pub verify_skip_metadata: bool,

    /// Check restored content against the recorded digest
    pub verify_restored_hash: bool,

    pub retry: RetryPolicy,

    /// Worker pool size, clamped to 1..=128. Defaults to max(cpus, 8).
    pub concurrency: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_history: true,
            sync: false,
            verify_after_write: false,
            hash: None,
            encryption: None,
            follow_symlinks: false,
            restore_policy: RestorePolicy::Default,
            copy_attributes: true,
            copy_security: false,
            verify_skip_metadata: false,
            verify_restored_hash: true,
            retry: RetryPolicy::default(),
            concurrency: None,
        }
    }
}

pub fn pool_size(configured: Option<usize>) -> usize {
    match configured {
        Some(n) => n.clamp(1, MAX_POOL_SIZE),
        None => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(MIN_POOL_SIZE, MAX_POOL_SIZE),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Backup,
    Restore,
    Verify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Backup => write!(f, "Backup"),
            Operation::Restore => write!(f, "Restore"),
            Operation::Verify => write!(f, "Verify"),
        }
    }
}

/// Outcome of one fanned-out batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Everything a file task needs, shared across the tasks of one run.
pub struct RunContext {
    pub(crate) local: Arc<dyn FileSystemProvider>,
    pub(crate) archive: Arc<dyn FileSystemProvider>,
    pub(crate) options: Arc<Options>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) log: Arc<RunLog>,
    pub(crate) cancel: CancellationToken,
    pub(crate) pool: Arc<Semaphore>,
    pub(crate) cipher: Option<Arc<CipherSuite>>,
    ignore: HashSet<String>,
}

impl RunContext {
    pub(crate) fn is_ignored(&self, name: &str) -> bool {
        self.ignore.contains(&fold(name))
    }

    /// Symlinks are only walked when configured.
    pub(crate) fn admits(&self, entry: &DirEntry) -> bool {
        !entry.is_symlink || self.options.follow_symlinks
    }

    pub(crate) fn record_file_error(&self, path: &Path, err: &EngineError) {
        self.stats.errored();
        self.log
            .error(&[err.code(), &path.display().to_string(), &describe(err)]);
    }

    pub(crate) fn record_dir_error(&self, path: &Path, err: &EngineError) {
        self.stats.dir_errored();
        self.log
            .error(&[err.code(), &path.display().to_string(), &describe(err)]);
    }

    /// Run `work` for every item on the worker pool and wait for all of them.
    ///
    /// Each item carries the path used to report its failure. Failures are counted
    /// and logged here; cancelled tasks are counted as cancelled, never as errors.
    pub(crate) async fn fan_out<T, F, Fut>(
        self: &Arc<Self>,
        items: Vec<(PathBuf, T)>,
        work: F,
    ) -> Batch
    where
        T: Send + 'static,
        F: Fn(Arc<RunContext>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(items.len());

        for (path, item) in items {
            let ctx = Arc::clone(self);
            let work = Arc::clone(&work);

            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = Arc::clone(&ctx.pool).acquire_owned() => {
                        permit.map_err(|e| EngineError::Task(format!("worker pool closed: {}", e)))?
                    }
                    _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                };

                if ctx.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }

                work(Arc::clone(&ctx), item).await
            });

            handles.push((path, handle));
        }

        let mut batch = Batch::default();
        for (path, handle) in handles {
            match handle.await {
                Ok(Ok(())) => batch.succeeded += 1,
                Ok(Err(e)) if e.is_cancelled() => {
                    self.stats.cancelled();
                    batch.cancelled += 1;
                }
                Ok(Err(e)) => {
                    self.record_file_error(&path, &e);
                    batch.failed += 1;
                }
                Err(e) => {
                    error!("File task for {} panicked: {}", path.display(), e);
                    self.record_file_error(&path, &EngineError::Task(e.to_string()));
                    batch.failed += 1;
                }
            }
        }
        batch
    }
}

/// Runs backup, restore and verify over a local and an archive provider.
pub struct Engine {
    local: Arc<dyn FileSystemProvider>,
    archive: Arc<dyn FileSystemProvider>,
    options: Arc<Options>,
    stats: Arc<Stats>,
    log: Arc<RunLog>,
    cancel: CancellationToken,
    pool: Arc<Semaphore>,
    cipher: Option<Arc<CipherSuite>>,
    unflushed: AtomicBool,
}

impl Engine {
    pub fn new(
        local: Arc<dyn FileSystemProvider>,
        archive: Arc<dyn FileSystemProvider>,
        options: Options,
        log: Arc<RunLog>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let cipher = match &options.encryption {
            Some(enc) => Some(Arc::new(CipherSuite::new(&enc.password, enc.kdf())?)),
            None => None,
        };
        let pool = Arc::new(Semaphore::new(pool_size(options.concurrency)));

        Ok(Self {
            local,
            archive,
            options: Arc::new(options),
            stats: Arc::new(Stats::new()),
            log,
            cancel,
            pool,
            cipher,
            unflushed: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Back up `local_dir` into `archive_dir`.
    pub async fn backup(
        &self,
        local_dir: &Path,
        archive_dir: &Path,
        ignore: &[String],
    ) -> Result<StatsSnapshot> {
        self.run(Operation::Backup, local_dir, archive_dir, ignore).await
    }

    /// Replay the snapshots under `archive_dir` onto `local_dir`.
    pub async fn restore(
        &self,
        archive_dir: &Path,
        local_dir: &Path,
        ignore: &[String],
    ) -> Result<StatsSnapshot> {
        self.run(Operation::Restore, archive_dir, local_dir, ignore).await
    }

    /// Audit `local_dir` against the snapshots under `archive_dir`. Read-only.
    pub async fn verify(
        &self,
        local_dir: &Path,
        archive_dir: &Path,
        ignore: &[String],
    ) -> Result<StatsSnapshot> {
        self.run(Operation::Verify, local_dir, archive_dir, ignore).await
    }

    fn context(&self, ignore: &[String]) -> Arc<RunContext> {
        Arc::new(RunContext {
            local: Arc::clone(&self.local),
            archive: Arc::clone(&self.archive),
            options: Arc::clone(&self.options),
            stats: Arc::clone(&self.stats),
            log: Arc::clone(&self.log),
            cancel: self.cancel.clone(),
            pool: Arc::clone(&self.pool),
            cipher: self.cipher.clone(),
            ignore: ignore.iter().map(|n| fold(n)).collect(),
        })
    }

    async fn run(
        &self,
        op: Operation,
        from: &Path,
        to: &Path,
        ignore: &[String],
    ) -> Result<StatsSnapshot> {
        if self.same_location(from, to).await {
            let err = EngineError::SamePath(from.to_path_buf());
            self.log
                .error(&[err.code(), &from.display().to_string(), &describe(&err)]);
            return Err(err);
        }

        info!(
            "{} started: {} -> {} (pool: {}, local: {}, archive: {})",
            op,
            from.display(),
            to.display(),
            self.pool.available_permits(),
            self.local.location(),
            self.archive.location()
        );
        self.unflushed.store(true, Ordering::SeqCst);

        let ctx = self.context(ignore);
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        let result = match op {
            Operation::Backup => backup::backup_dir(Arc::clone(&ctx), from.clone(), to).await,
            Operation::Restore => restore::restore_dir(Arc::clone(&ctx), from.clone(), to).await,
            Operation::Verify => verify::verify_dir(Arc::clone(&ctx), from.clone(), to).await,
        };

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                info!("{} cancelled", op);
                Ok(())
            }
            Err(e) => {
                ctx.record_dir_error(&from, &e);
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        };

        let stats = self.flush_stats();
        info!("{} finished: {}", op, stats.summary());
        outcome.map(|()| stats)
    }

    /// Both sides resolve to the same storage location.
    async fn same_location(&self, from: &Path, to: &Path) -> bool {
        if self.local.location() != self.archive.location() {
            return false;
        }
        let lexical = |p: &Path| p.components().collect::<PathBuf>();
        if lexical(from) == lexical(to) {
            return true;
        }
        match (tokio::fs::canonicalize(from).await, tokio::fs::canonicalize(to).await) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn flush_stats(&self) -> StatsSnapshot {
        let stats = self.stats.snapshot();
        self.log.error(&["Stats", &stats.to_string()]);
        self.unflushed.store(false, Ordering::SeqCst);
        stats
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // A run future dropped mid-way never reached its own flush
        if self.unflushed.load(Ordering::SeqCst) {
            self.flush_stats();
        }
    }
}
