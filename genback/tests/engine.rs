//! End-to-end runs of the engine over temporary directories.

use async_trait::async_trait;
use genback::executor::manifest::{is_snapshot_name, latest_snapshot};
use filetime::FileTime;
use genback::fs::{
    BoxReader, BoxWriter, DirEntry, FileMeta, FileSystemProvider, LocalFileSystem, MetadataScope,
};
use genback::transfer::HashAlgorithm;
use genback::utils::{RetryPolicy, RunLog};
use genback::{EncryptionOptions, Engine, EngineError, Options, RestorePolicy, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn options() -> Options {
    Options {
        retry: RetryPolicy {
            attempts: 2,
            backoff_ms: 1,
        },
        concurrency: Some(4),
        ..Default::default()
    }
}

fn encrypted_options() -> Options {
    let mut encryption = EncryptionOptions::new("correct horse");
    encryption.kdf_memory_kib = 1024;
    encryption.kdf_iterations = 1;
    Options {
        encryption: Some(encryption),
        ..options()
    }
}

fn engine(options: Options) -> Engine {
    engine_with(Arc::new(LocalFileSystem::new()), options, Arc::new(RunLog::console()))
}

fn engine_with(local: Arc<dyn FileSystemProvider>, options: Options, log: Arc<RunLog>) -> Engine {
    Engine::new(
        local,
        Arc::new(LocalFileSystem::new()),
        options,
        log,
        CancellationToken::new(),
    )
    .unwrap()
}

fn file_log(fx: &Fixture) -> (PathBuf, Arc<RunLog>) {
    let path = fx.root.join("logs").join("errors.csv");
    let log = Arc::new(RunLog::open(None, Some(path.as_path())).unwrap());
    (path, log)
}

struct Fixture {
    _temp: TempDir,
    source: PathBuf,
    archive: PathBuf,
    root: PathBuf,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    let source = root.join("source");
    std::fs::create_dir(&source).unwrap();
    std::fs::write(source.join("a.txt"), b"alpha").unwrap();
    std::fs::write(source.join("b.txt"), b"bravo bravo").unwrap();
    Fixture {
        _temp: temp,
        archive: root.join("archive"),
        source,
        root,
    }
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn snapshot_names(dir: &Path) -> Vec<String> {
    names(dir).into_iter().filter(|n| is_snapshot_name(n)).collect()
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[tokio::test]
async fn test_second_run_skips_unchanged_files() -> Result<()> {
    let fx = fixture();

    let first = engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(first.copy_files, 2);
    assert_eq!(first.skip_files, 0);
    assert_eq!(first.copy_bytes, 16);

    let second = engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(second.copy_files, 0);
    assert_eq!(second.skip_files, 2);

    std::fs::write(fx.source.join("a.txt"), b"alpha, revised")?;
    let third = engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(third.copy_files, 1);
    assert_eq!(third.skip_files, 1);
    assert!(!third.has_errors());
    Ok(())
}

#[tokio::test]
async fn test_backup_then_restore_round_trip() -> Result<()> {
    let fx = fixture();
    let nested = fx.source.join("docs").join("deep");
    std::fs::create_dir_all(&nested)?;
    std::fs::write(nested.join("c.txt"), b"charlie")?;

    let backed_up = engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(backed_up.copy_files, 3);

    let target = fx.root.join("restored");
    let restored = engine(options()).restore(&fx.archive, &target, &[]).await?;
    assert_eq!(restored.copy_files, 3);
    assert!(!restored.has_errors());

    for rel in ["a.txt", "b.txt", "docs/deep/c.txt"] {
        let original = fx.source.join(rel);
        let copy = target.join(rel);
        assert_eq!(std::fs::read(&original)?, std::fs::read(&copy)?, "{}", rel);
        let drift = match mtime(&original).duration_since(mtime(&copy)) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        assert!(drift < Duration::from_secs(1), "{} mtime drifted by {:?}", rel, drift);
    }

    // Nothing left to do on a second restore
    let again = engine(options()).restore(&fx.archive, &target, &[]).await?;
    assert_eq!(again.copy_files, 0);
    assert_eq!(again.skip_files, 3);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_names_increase() -> Result<()> {
    let fx = fixture();
    for _ in 0..3 {
        engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    }

    let snapshots = snapshot_names(&fx.archive);
    assert_eq!(snapshots.len(), 3);
    let mut sorted = snapshots.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, snapshots);

    let fs = LocalFileSystem::new();
    let latest = latest_snapshot(&fs, &fx.archive, true).await?.unwrap();
    assert_eq!(latest.files.len(), 2);
    assert!(latest.entry("A.TXT").is_some());
    Ok(())
}

#[tokio::test]
async fn test_modified_files_keep_history() -> Result<()> {
    let fx = fixture();
    engine(options()).backup(&fx.source, &fx.archive, &[]).await?;

    for round in 1..=3 {
        std::fs::write(fx.source.join("a.txt"), "x".repeat(10 + round))?;
        let stats = engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
        assert_eq!(stats.copy_files, 1);
    }

    let history: Vec<String> = names(&fx.archive)
        .into_iter()
        .filter(|n| n.starts_with(".old.a.txt."))
        .collect();
    assert_eq!(history.len(), 3, "{:?}", history);
    assert_eq!(std::fs::read(fx.archive.join("a.txt"))?, "x".repeat(13).into_bytes());
    Ok(())
}

#[tokio::test]
async fn test_history_is_dropped_when_disabled() -> Result<()> {
    let fx = fixture();
    let no_history = Options {
        keep_history: false,
        ..options()
    };
    engine(no_history.clone()).backup(&fx.source, &fx.archive, &[]).await?;
    std::fs::write(fx.source.join("a.txt"), b"alpha, second edition")?;
    engine(no_history).backup(&fx.source, &fx.archive, &[]).await?;

    assert!(names(&fx.archive).iter().all(|n| !n.starts_with(".old.")));
    Ok(())
}

#[tokio::test]
async fn test_sync_removes_vanished_items() -> Result<()> {
    let fx = fixture();
    std::fs::create_dir(fx.source.join("gone"))?;
    std::fs::write(fx.source.join("gone").join("d.txt"), b"delta")?;
    engine(encrypted_options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert!(fx.archive.join("b.txt.genc").exists());
    assert!(fx.archive.join("gone").join("d.txt.genc").exists());

    std::fs::remove_file(fx.source.join("b.txt"))?;
    std::fs::remove_dir_all(fx.source.join("gone"))?;
    let stats = engine(Options {
        sync: true,
        ..encrypted_options()
    })
    .backup(&fx.source, &fx.archive, &[])
    .await?;

    assert_eq!(stats.sync_deleted_files, 1);
    assert_eq!(stats.sync_deleted_dirs, 1);
    assert_eq!(stats.sync_delete_failures, 0);
    assert!(fx.archive.join("a.txt.genc").exists());
    assert!(!fx.archive.join("b.txt.genc").exists());
    assert!(!fx.archive.join("gone").exists());
    assert_eq!(snapshot_names(&fx.archive).len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_ignored_subdirectories_are_skipped() -> Result<()> {
    let fx = fixture();
    std::fs::create_dir(fx.source.join("Cache"))?;
    std::fs::write(fx.source.join("Cache").join("blob.bin"), b"0123")?;

    let stats = engine(options())
        .backup(&fx.source, &fx.archive, &["cache".to_string()])
        .await?;
    assert_eq!(stats.copy_files, 2);
    assert!(!fx.archive.join("Cache").exists());

    let fs = LocalFileSystem::new();
    let latest = latest_snapshot(&fs, &fx.archive, true).await?.unwrap();
    assert!(latest.subdirectories.is_empty());
    Ok(())
}

/// What `FaultyFileSystem` does when the target file is opened.
enum Fault {
    /// Every open fails with a permission error
    Denied,
    /// The first open times out, later ones succeed
    TimesOutOnce(AtomicBool),
    /// Opening cancels the run and then never completes
    Cancels(CancellationToken),
    /// Opens are only counted
    Counted,
}

/// Local provider that injects a fault when one file name is opened.
struct FaultyFileSystem {
    inner: LocalFileSystem,
    target: &'static str,
    fault: Fault,
    opens: AtomicUsize,
}

impl FaultyFileSystem {
    fn new(target: &'static str, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalFileSystem::new(),
            target,
            fault,
            opens: AtomicUsize::new(0),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystemProvider for FaultyFileSystem {
    fn location(&self) -> &str {
        "faulty"
    }

    async fn list(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        self.inner.list(dir).await
    }

    async fn metadata(&self, path: &Path) -> Result<Option<FileMeta>> {
        self.inner.metadata(path).await
    }

    async fn set_metadata(
        &self,
        path: &Path,
        meta: &FileMeta,
        scope: MetadataScope,
    ) -> Result<()> {
        self.inner.set_metadata(path, meta, scope).await
    }

    async fn create_dir(&self, path: &Path, compressed: bool) -> Result<()> {
        self.inner.create_dir(path, compressed).await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.inner.remove_dir(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        self.inner.remove_file(path).await
    }

    async fn set_hidden(&self, path: &Path) -> Result<()> {
        self.inner.set_hidden(path).await
    }

    async fn open(&self, path: &Path) -> Result<BoxReader> {
        if path.file_name().map(|n| n == self.target).unwrap_or(false) {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match &self.fault {
                Fault::Denied => {
                    return Err(EngineError::io(
                        path,
                        io::Error::new(io::ErrorKind::PermissionDenied, "locked"),
                    ));
                }
                Fault::TimesOutOnce(fired) => {
                    if !fired.swap(true, Ordering::SeqCst) {
                        return Err(EngineError::io(
                            path,
                            io::Error::new(io::ErrorKind::TimedOut, "stalled"),
                        ));
                    }
                }
                Fault::Cancels(token) => {
                    token.cancel();
                    std::future::pending::<()>().await;
                }
                Fault::Counted => {}
            }
        }
        self.inner.open(path).await
    }

    async fn create(&self, path: &Path) -> Result<BoxWriter> {
        self.inner.create(path).await
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.inner.write_atomic(path, contents).await
    }
}

#[tokio::test]
async fn test_partial_failure_still_writes_snapshot() -> Result<()> {
    let fx = fixture();
    let faulty = FaultyFileSystem::new("b.txt", Fault::Denied);

    let stats = engine_with(faulty, options(), Arc::new(RunLog::console()))
        .backup(&fx.source, &fx.archive, &[])
        .await?;
    assert_eq!(stats.copy_files, 1);
    assert_eq!(stats.error_files, 1);
    assert!(stats.has_errors());

    let fs = LocalFileSystem::new();
    let latest = latest_snapshot(&fs, &fx.archive, true).await?.unwrap();
    assert!(latest.entry("a.txt").is_some());
    assert!(latest.entry("b.txt").is_none());

    // The next healthy run picks the failed file up
    let retry = engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(retry.copy_files, 1);
    assert_eq!(retry.skip_files, 1);
    Ok(())
}

#[tokio::test]
async fn test_verify_reports_corrupted_blob() -> Result<()> {
    let fx = fixture();
    engine(options()).backup(&fx.source, &fx.archive, &[]).await?;

    let clean = engine(options()).verify(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(clean.verified_files, 2);
    assert!(!clean.has_errors());

    // Same size, different bytes
    std::fs::write(fx.archive.join("b.txt"), b"BRAVO BRAVO")?;

    let (error_log, log) = file_log(&fx);
    let stats = engine_with(Arc::new(LocalFileSystem::new()), options(), log)
        .verify(&fx.source, &fx.archive, &[])
        .await?;
    assert_eq!(stats.verified_files, 1);
    assert_eq!(stats.error_files, 1);

    let text = std::fs::read_to_string(&error_log)?;
    let mismatches: Vec<&str> = text
        .lines()
        .filter(|l| l.contains("FileDataDifferent"))
        .collect();
    assert_eq!(mismatches.len(), 1, "{}", text);
    assert!(mismatches[0].contains("b.txt"));
    assert!(text.lines().any(|l| l.contains("Stats")));
    Ok(())
}

#[tokio::test]
async fn test_verify_flags_files_missing_from_snapshot() -> Result<()> {
    let fx = fixture();
    engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    std::fs::write(fx.source.join("new.txt"), b"fresh")?;

    let stats = engine(options()).verify(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(stats.verified_files, 2);
    assert_eq!(stats.error_files, 1);
    Ok(())
}

#[tokio::test]
async fn test_encrypted_round_trip() -> Result<()> {
    let fx = fixture();
    let stats = engine(encrypted_options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(stats.copy_files, 2);

    let archived = names(&fx.archive);
    assert!(archived.contains(&"a.txt.genc".to_string()));
    assert!(!archived.contains(&"a.txt".to_string()));
    assert_ne!(std::fs::read(fx.archive.join("a.txt.genc"))?, b"alpha".to_vec());

    let again = engine(encrypted_options()).backup(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(again.skip_files, 2);

    let verified = engine(encrypted_options()).verify(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(verified.verified_files, 2);

    let target = fx.root.join("restored");
    let restored = engine(encrypted_options()).restore(&fx.archive, &target, &[]).await?;
    assert_eq!(restored.copy_files, 2);
    assert_eq!(std::fs::read(target.join("a.txt"))?, b"alpha".to_vec());
    assert_eq!(std::fs::read(target.join("b.txt"))?, b"bravo bravo".to_vec());

    // Without the password the blobs cannot be restored
    let other = fx.root.join("no-password");
    let refused = engine(options()).restore(&fx.archive, &other, &[]).await?;
    assert_eq!(refused.error_files, 2);
    Ok(())
}

#[tokio::test]
async fn test_restore_without_snapshot_fails() {
    let fx = fixture();
    std::fs::create_dir(&fx.archive).unwrap();

    let err = engine(options())
        .restore(&fx.archive, &fx.root.join("restored"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingSnapshot(_)));
}

#[tokio::test]
async fn test_backup_of_missing_source_fails() {
    let fx = fixture();
    let err = engine(options())
        .backup(&fx.root.join("nowhere"), &fx.archive, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DirectoryNotFound(_)));
}

#[tokio::test]
async fn test_case_colliding_names_are_rejected_before_copy() -> Result<()> {
    let fx = fixture();
    if fx.source.join("A.txt").exists() {
        // Case-insensitive filesystem: the collision cannot be set up
        return Ok(());
    }
    std::fs::remove_file(fx.source.join("b.txt"))?;
    std::fs::write(fx.source.join("A.txt"), b"upper")?;

    for round in 0..3 {
        let stats = engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
        assert_eq!(stats.error_files, 1, "round {}", round);
        assert_eq!(stats.copy_files + stats.skip_files, 1, "round {}", round);
    }

    // The first name in listing order is kept, the other is never copied
    let archived = names(&fx.archive);
    assert!(archived.iter().all(|n| !n.starts_with(".old.")), "{:?}", archived);
    assert!(archived.contains(&"A.txt".to_string()));
    assert!(!archived.contains(&"a.txt".to_string()));
    assert_eq!(std::fs::read(fx.archive.join("A.txt"))?, b"upper".to_vec());

    let fs = LocalFileSystem::new();
    let latest = latest_snapshot(&fs, &fx.archive, true).await?.unwrap();
    assert_eq!(latest.files.len(), 1);
    assert_eq!(latest.entry("a.txt").map(|e| e.name.as_str()), Some("A.txt"));
    Ok(())
}

#[tokio::test]
async fn test_collision_error_is_logged() -> Result<()> {
    let fx = fixture();
    if fx.source.join("A.TXT").exists() {
        // Case-insensitive filesystem: the collision cannot be set up
        return Ok(());
    }
    std::fs::write(fx.source.join("A.TXT"), b"shouting")?;

    let (error_log, log) = file_log(&fx);
    let stats = engine_with(Arc::new(LocalFileSystem::new()), options(), log)
        .backup(&fx.source, &fx.archive, &[])
        .await?;
    assert_eq!(stats.copy_files, 2);
    assert_eq!(stats.error_files, 1);

    let text = std::fs::read_to_string(&error_log)?;
    let duplicates: Vec<&str> = text
        .lines()
        .filter(|l| l.contains("DuplicateEntry"))
        .collect();
    assert_eq!(duplicates.len(), 1, "{}", text);
    assert!(duplicates[0].contains("a.txt"));
    Ok(())
}

#[tokio::test]
async fn test_restored_tree_verifies_clean() -> Result<()> {
    let fx = fixture();
    engine(options()).backup(&fx.source, &fx.archive, &[]).await?;

    let target = fx.root.join("restored");
    let restored = engine(options()).restore(&fx.archive, &target, &[]).await?;
    assert_eq!(restored.copy_files, 2);

    let verified = engine(options()).verify(&target, &fx.archive, &[]).await?;
    assert_eq!(verified.verified_files, 2);
    assert_eq!(verified.error_files, 0);
    Ok(())
}

#[tokio::test]
async fn test_restore_displaces_local_changes() -> Result<()> {
    let fx = fixture();
    engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    let target = fx.root.join("restored");
    engine(options()).restore(&fx.archive, &target, &[]).await?;

    std::fs::write(target.join("a.txt"), b"edited locally")?;
    let stats = engine(options()).restore(&fx.archive, &target, &[]).await?;
    assert_eq!(stats.copy_files, 1);
    assert_eq!(stats.skip_files, 1);
    assert!(!stats.has_errors());

    assert_eq!(std::fs::read(target.join("a.txt"))?, b"alpha".to_vec());
    let displaced = target.join(".original.a.txt.0001.original");
    assert_eq!(std::fs::read(&displaced)?, b"edited locally".to_vec());
    assert!(!target.join(".original.b.txt.0001.original").exists());
    Ok(())
}

#[tokio::test]
async fn test_restore_policies() -> Result<()> {
    let fx = fixture();
    engine(options()).backup(&fx.source, &fx.archive, &[]).await?;
    let target = fx.root.join("restored");
    engine(options()).restore(&fx.archive, &target, &[]).await?;

    // Local edit stamped later than anything in the archive
    std::fs::write(target.join("a.txt"), b"edited locally")?;
    let future = FileTime::from_unix_time(4_102_444_800, 0);
    filetime::set_file_mtime(target.join("a.txt"), future)?;

    let only_newer = Options {
        restore_policy: RestorePolicy::OnlyNewer,
        ..options()
    };
    let stats = engine(only_newer).restore(&fx.archive, &target, &[]).await?;
    assert_eq!(stats.copy_files, 0);
    assert_eq!(stats.skip_files, 2);
    assert_eq!(std::fs::read(target.join("a.txt"))?, b"edited locally".to_vec());

    let always = Options {
        restore_policy: RestorePolicy::AlwaysOverwrite,
        ..options()
    };
    let stats = engine(always).restore(&fx.archive, &target, &[]).await?;
    assert_eq!(stats.copy_files, 2);
    assert_eq!(stats.skip_files, 0);
    assert_eq!(std::fs::read(target.join("a.txt"))?, b"alpha".to_vec());
    assert_eq!(
        std::fs::read(target.join(".original.a.txt.0001.original"))?,
        b"edited locally".to_vec()
    );
    // Identical files are replaced too
    assert_eq!(
        std::fs::read(target.join(".original.b.txt.0001.original"))?,
        b"bravo bravo".to_vec()
    );
    Ok(())
}

#[tokio::test]
async fn test_restore_rechecks_recorded_digest() -> Result<()> {
    let fx = fixture();
    let hashed = Options {
        hash: Some(HashAlgorithm::Sha256),
        ..options()
    };
    engine(hashed.clone()).backup(&fx.source, &fx.archive, &[]).await?;

    // Same size, different bytes
    std::fs::write(fx.archive.join("b.txt"), b"BRAVO BRAVO")?;

    let archive = FaultyFileSystem::new("b.txt", Fault::Counted);
    let (error_log, log) = file_log(&fx);
    let engine = Engine::new(
        Arc::new(LocalFileSystem::new()),
        archive.clone(),
        hashed,
        log,
        CancellationToken::new(),
    )?;
    let target = fx.root.join("restored");
    let stats = engine.restore(&fx.archive, &target, &[]).await?;
    assert_eq!(stats.copy_files, 1);
    assert_eq!(stats.error_files, 1);
    assert_eq!(stats.recovered_files, 0);

    // Retried until the attempts ran out
    assert_eq!(archive.opens(), 2);
    let text = std::fs::read_to_string(&error_log)?;
    assert!(
        text.lines()
            .any(|l| l.contains("HashMismatch") && l.contains("b.txt")),
        "{}",
        text
    );
    Ok(())
}

#[tokio::test]
async fn test_transient_failure_is_recovered() -> Result<()> {
    let fx = fixture();
    let flaky = FaultyFileSystem::new("b.txt", Fault::TimesOutOnce(AtomicBool::new(false)));

    let stats = engine_with(flaky.clone(), options(), Arc::new(RunLog::console()))
        .backup(&fx.source, &fx.archive, &[])
        .await?;
    assert_eq!(stats.copy_files, 1);
    assert_eq!(stats.recovered_files, 1);
    assert_eq!(stats.error_files, 0);
    assert_eq!(flaky.opens(), 2);
    assert_eq!(std::fs::read(fx.archive.join("b.txt"))?, b"bravo bravo".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_cancellation_is_not_an_error() -> Result<()> {
    let fx = fixture();
    std::fs::create_dir(fx.source.join("docs"))?;
    std::fs::write(fx.source.join("docs").join("c.txt"), b"charlie")?;

    let cancel = CancellationToken::new();
    let local = FaultyFileSystem::new("b.txt", Fault::Cancels(cancel.clone()));
    let engine = Engine::new(
        local,
        Arc::new(LocalFileSystem::new()),
        options(),
        Arc::new(RunLog::console()),
        cancel,
    )?;
    let stats = engine.backup(&fx.source, &fx.archive, &[]).await?;
    assert!(stats.cancelled_files >= 1);
    assert_eq!(stats.error_files, 0);
    assert_eq!(stats.copy_files + stats.cancelled_files, 2);

    // The visited directory keeps its snapshot, the rest of the tree is not entered
    let fs = LocalFileSystem::new();
    let latest = latest_snapshot(&fs, &fx.archive, true).await?.unwrap();
    assert!(latest.entry("b.txt").is_none());
    assert!(!fx.archive.join("docs").exists());
    Ok(())
}

#[tokio::test]
async fn test_verify_can_skip_metadata() -> Result<()> {
    let fx = fixture();
    engine(options()).backup(&fx.source, &fx.archive, &[]).await?;

    // Content unchanged, timestamp moved
    let past = FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(fx.source.join("a.txt"), past)?;

    let (error_log, log) = file_log(&fx);
    let strict = engine_with(Arc::new(LocalFileSystem::new()), options(), log)
        .verify(&fx.source, &fx.archive, &[])
        .await?;
    assert_eq!(strict.verified_files, 1);
    assert_eq!(strict.error_files, 1);
    let text = std::fs::read_to_string(&error_log)?;
    assert!(
        text.lines()
            .any(|l| l.contains("FileMetadataDifferent") && l.contains("a.txt")),
        "{}",
        text
    );

    let lenient = Options {
        verify_skip_metadata: true,
        ..options()
    };
    let stats = engine(lenient).verify(&fx.source, &fx.archive, &[]).await?;
    assert_eq!(stats.verified_files, 2);
    assert_eq!(stats.error_files, 0);
    Ok(())
}
