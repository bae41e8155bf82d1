//! Content comparison between a local file and its archived blob.

use crate::crypto::{read_full, CipherSuite};
use crate::fs::{BoxReader, FileSystemProvider};
use crate::utils::errors::{EngineError, Result};
use std::io;
use std::path::Path;
use tokio_util::sync::CancellationToken;

const BLOCK_SIZE: usize = 64 * 1024;

/// Stream both sides in fixed blocks and report whether they hold the same bytes.
/// With `cipher` set the archive side is decrypted on the fly; a blob that fails
/// authentication compares as different.
pub async fn contents_equal(
    local_fs: &dyn FileSystemProvider,
    local: &Path,
    archive_fs: &dyn FileSystemProvider,
    archive: &Path,
    cipher: Option<&CipherSuite>,
    cancel: &CancellationToken,
) -> Result<bool> {
    tokio::select! {
        equal = compare_inner(local_fs, local, archive_fs, archive, cipher) => equal,
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
    }
}

async fn compare_inner(
    local_fs: &dyn FileSystemProvider,
    local: &Path,
    archive_fs: &dyn FileSystemProvider,
    archive: &Path,
    cipher: Option<&CipherSuite>,
) -> Result<bool> {
    let mut left = local_fs.open(local).await?;
    let raw = archive_fs.open(archive).await?;
    let mut right: BoxReader = match cipher {
        Some(cipher) => match cipher.decrypt_reader(raw).await {
            Ok(reader) => reader,
            Err(EngineError::Crypto(reason)) => {
                tracing::debug!(
                    path = %archive.display(),
                    %reason,
                    "archive blob is not readable as ciphertext"
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        },
        None => raw,
    };

    let mut a = vec![0u8; BLOCK_SIZE];
    let mut b = vec![0u8; BLOCK_SIZE];
    loop {
        let n = read_full(&mut left, &mut a)
            .await
            .map_err(|e| EngineError::io(local, e))?;
        let m = match read_full(&mut right, &mut b).await {
            Ok(m) => m,
            Err(e) if cipher.is_some() && e.kind() == io::ErrorKind::InvalidData => {
                return Ok(false)
            }
            Err(e) => return Err(EngineError::io(archive, e)),
        };
        if n != m || a[..n] != b[..m] {
            return Ok(false);
        }
        if n < BLOCK_SIZE {
            return Ok(true);
        }
    }
}
