//! Storage provider abstraction.
//!
//! The engine talks to two independent providers per run: the local tree and the
//! archive tree. They may be different backends; all the engine needs is the
//! operations on `FileSystemProvider`.

pub mod local;
pub mod metadata;

pub use local::LocalFileSystem;
pub use metadata::{FileMeta, MetadataScope, Owner};

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One item of a directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,

    /// The entry itself is a symbolic link; `kind` and `meta` describe its target
    pub is_symlink: bool,

    pub meta: FileMeta,
}

impl DirEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

#[async_trait]
pub trait FileSystemProvider: Send + Sync {
    /// Identifies the backend instance; two providers with the same location resolve
    /// equal paths to the same storage.
    fn location(&self) -> &str;

    /// List a directory. Broken symlinks and names that are not valid UTF-8 are skipped.
    async fn list(&self, dir: &Path) -> Result<Vec<DirEntry>>;

    /// Metadata of a file or directory, `None` when it does not exist.
    async fn metadata(&self, path: &Path) -> Result<Option<FileMeta>>;

    async fn set_metadata(&self, path: &Path, meta: &FileMeta, scope: MetadataScope) -> Result<()>;

    /// Create one directory level. `compressed` asks for transparent compression and
    /// may be unsupported.
    async fn create_dir(&self, path: &Path, compressed: bool) -> Result<()>;

    /// Remove a directory and everything below it.
    async fn remove_dir(&self, path: &Path) -> Result<()>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Best-effort hidden flag.
    async fn set_hidden(&self, path: &Path) -> Result<()>;

    async fn open(&self, path: &Path) -> Result<BoxReader>;

    /// Create or truncate a file for writing.
    async fn create(&self, path: &Path) -> Result<BoxWriter>;

    /// Write a whole file so that readers never observe a partial version.
    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()>;

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        let mut reader = self.open(path).await?;
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .await
            .map_err(|e| EngineError::io(path, e))?;
        Ok(text)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.metadata(path).await?.is_some())
    }
}
