//! `FileSystemProvider` over the local file system.

use super::metadata::{self, FileMeta, MetadataScope};
use super::{BoxReader, BoxWriter, DirEntry, EntryKind, FileSystemProvider};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

/// Run a blocking std::fs call off the async workers.
async fn blocking<T, F>(path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(PathBuf) -> io::Result<T> + Send + 'static,
{
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || f(owned))
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
        .map_err(|e| EngineError::io(path, e))
}

#[async_trait]
impl FileSystemProvider for LocalFileSystem {
    fn location(&self) -> &str {
        "local"
    }

    async fn list(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let mut reader = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| EngineError::io(dir, e))?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await.map_err(|e| EngineError::io(dir, e))? {
            let path = entry.path();
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("Skipping entry with non UTF-8 name: {:?}", raw);
                    continue;
                }
            };

            let file_type = entry.file_type().await.map_err(|e| EngineError::io(&path, e))?;
            let is_symlink = file_type.is_symlink();

            // For symlinks, resolve to the target
            let resolved = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) if is_symlink => {
                    warn!("Skipping broken symlink {}: {}", path.display(), e);
                    continue;
                }
                Err(e) => return Err(EngineError::io(&path, e)),
            };

            let kind = if resolved.is_dir() {
                EntryKind::Directory
            } else if resolved.is_file() {
                EntryKind::File
            } else {
                // Sockets, fifos and devices are not backed up
                continue;
            };

            entries.push(DirEntry {
                name,
                kind,
                is_symlink,
                meta: FileMeta::from_std(&resolved),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn metadata(&self, path: &Path) -> Result<Option<FileMeta>> {
        match tokio::fs::metadata(path).await {
            Ok(m) => Ok(Some(FileMeta::from_std(&m))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    async fn set_metadata(&self, path: &Path, meta: &FileMeta, scope: MetadataScope) -> Result<()> {
        let meta = meta.clone();
        blocking(path, move |p| metadata::apply_to_path(&p, &meta, scope)).await
    }

    async fn create_dir(&self, path: &Path, compressed: bool) -> Result<()> {
        if compressed {
            return Err(EngineError::io(
                path,
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    "transparent compression is not available on this file system",
                ),
            ));
        }
        tokio::fs::create_dir(path)
            .await
            .map_err(|e| EngineError::io(path, e))
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| EngineError::io(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| EngineError::io(from, e))
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| EngineError::io(path, e))
    }

    async fn set_hidden(&self, _path: &Path) -> Result<()> {
        // Dot-prefixed names are already hidden on Unix; there is no attribute to set.
        Ok(())
    }

    async fn open(&self, path: &Path) -> Result<BoxReader> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| EngineError::io(path, e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &Path) -> Result<BoxWriter> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| EngineError::io(path, e))?;
        Ok(Box::new(file))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp = path.with_file_name(format!(".{}.partial", file_name));

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| EngineError::io(&temp, e))?;
        file.write_all(contents)
            .await
            .map_err(|e| EngineError::io(&temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::io(&temp, e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(EngineError::io(path, e));
        }
        Ok(())
    }
}
