//! Streaming file copy between two providers.

use super::digest::{digest_reader, HashAlgorithm};
use super::metered::{Meter, MeteredStream};
use crate::crypto::CipherSuite;
use crate::fs::{BoxReader, FileSystemProvider};
use crate::utils::errors::{EngineError, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

/// What happens to the bytes on their way through.
#[derive(Clone, Default)]
pub enum Transform {
    #[default]
    None,
    /// Plain source, encrypted (optionally compressed) destination
    Encrypt {
        cipher: Arc<CipherSuite>,
        compress: bool,
    },
    /// Encrypted source, plain destination
    Decrypt { cipher: Arc<CipherSuite> },
}

#[derive(Clone, Default)]
pub struct CopyOptions {
    pub transform: Transform,

    /// Re-read the destination and compare its plaintext digest with the source
    pub verify_after_write: bool,

    /// Digest of the plaintext to return with the outcome
    pub hash: Option<HashAlgorithm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Plaintext bytes moved
    pub plain_bytes: u64,

    /// Bytes written to the destination
    pub stored_bytes: u64,

    pub digest: Option<String>,
}

/// Copy `src` to `dst`, applying `opts.transform`. The destination is created or
/// truncated. Cancellation aborts the copy and leaves whatever was written in place.
pub async fn copy_file(
    src_fs: &dyn FileSystemProvider,
    src: &Path,
    dst_fs: &dyn FileSystemProvider,
    dst: &Path,
    opts: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<CopyOutcome> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    tokio::select! {
        outcome = copy_inner(src_fs, src, dst_fs, dst, opts, cancel) => outcome,
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
    }
}

async fn copy_inner(
    src_fs: &dyn FileSystemProvider,
    src: &Path,
    dst_fs: &dyn FileSystemProvider,
    dst: &Path,
    opts: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<CopyOutcome> {
    let check_algo = opts
        .hash
        .or(if opts.verify_after_write { Some(HashAlgorithm::default()) } else { None });
    let meter = Meter::new(check_algo);

    let raw = src_fs.open(src).await?;
    let plain: BoxReader = match &opts.transform {
        Transform::Decrypt { cipher } => cipher.decrypt_reader(raw).await?,
        _ => raw,
    };
    let mut metered = StreamReader::new(MeteredStream::new(
        ReaderStream::with_capacity(plain, CHUNK_SIZE),
        meter.clone(),
    ));

    let mut out = dst_fs.create(dst).await?;
    let stored_bytes = match &opts.transform {
        Transform::Encrypt { cipher, compress } => {
            cipher.encrypt(metered, &mut out, *compress, cancel).await?
        }
        _ => tokio::io::copy(&mut metered, &mut out)
            .await
            .map_err(|e| EngineError::io(src, e))?,
    };
    out.shutdown().await.map_err(|e| EngineError::io(dst, e))?;
    drop(out);

    let digest = meter.take_digest();
    if opts.verify_after_write {
        if let (Some(expected), Some(algo)) = (digest.as_deref(), check_algo) {
            let written = dst_fs.open(dst).await?;
            let mut readback: BoxReader = match &opts.transform {
                Transform::Encrypt { cipher, .. } => cipher.decrypt_reader(written).await?,
                _ => written,
            };
            let actual = digest_reader(&mut readback, algo, cancel).await?;
            if actual != expected {
                return Err(EngineError::HashMismatch {
                    path: dst.to_path_buf(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!(path = %dst.display(), "verified after write");
        }
    }

    Ok(CopyOutcome {
        plain_bytes: meter.bytes(),
        stored_bytes,
        digest: if opts.hash.is_some() { digest } else { None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::fs::LocalFileSystem;
    use std::fs;
    use tempfile::TempDir;

    fn cipher() -> Arc<CipherSuite> {
        Arc::new(
            CipherSuite::new(
                "secret",
                KdfParams {
                    memory_kib: 64,
                    iterations: 1,
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_plain_copy_with_digest_and_verify() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("a.txt");
        let dst = temp_dir.path().join("b.txt");
        fs::write(&src, b"abc")?;

        let local = LocalFileSystem::new();
        let opts = CopyOptions {
            verify_after_write: true,
            hash: Some(HashAlgorithm::Sha256),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let outcome = copy_file(&local, &src, &local, &dst, &opts, &cancel).await?;

        assert_eq!(fs::read(&dst)?, b"abc");
        assert_eq!(outcome.plain_bytes, 3);
        assert_eq!(outcome.stored_bytes, 3);
        assert_eq!(
            outcome.digest.as_deref(),
            Some("sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypt_then_decrypt() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("plain.bin");
        let sealed = temp_dir.path().join("plain.bin.genc");
        let back = temp_dir.path().join("restored.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 13) as u8).collect();
        fs::write(&src, &content)?;

        let local = LocalFileSystem::new();
        let cipher = cipher();
        let cancel = CancellationToken::new();

        let encrypt = CopyOptions {
            transform: Transform::Encrypt {
                cipher: cipher.clone(),
                compress: true,
            },
            verify_after_write: true,
            hash: None,
        };
        let outcome = copy_file(&local, &src, &local, &sealed, &encrypt, &cancel).await?;
        assert_eq!(outcome.plain_bytes, content.len() as u64);
        assert_eq!(outcome.stored_bytes, fs::metadata(&sealed)?.len());
        assert!(outcome.digest.is_none());
        assert_ne!(fs::read(&sealed)?, content);

        let decrypt = CopyOptions {
            transform: Transform::Decrypt { cipher },
            ..Default::default()
        };
        copy_file(&local, &sealed, &local, &back, &decrypt, &cancel).await?;
        assert_eq!(fs::read(&back)?, content);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_before_start() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, b"abc")?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let local = LocalFileSystem::new();
        let err = copy_file(
            &local,
            &src,
            &local,
            &temp_dir.path().join("b.txt"),
            &CopyOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!temp_dir.path().join("b.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let local = LocalFileSystem::new();
        let err = copy_file(
            &local,
            &temp_dir.path().join("missing"),
            &local,
            &temp_dir.path().join("out"),
            &CopyOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }
}
