//! Error taxonomy for the backup engine.
//!
//! Every failure the engine can observe maps onto one `EngineError` variant. The
//! helper predicates (`is_retryable`, `is_fatal`, `is_cancelled`) decide how far an
//! error travels: retryable errors are absorbed by the retry policy, fatal errors
//! unwind to the caller of the directory they occurred in, cancellation is never
//! counted as a failure and everything else stays scoped to one file or directory.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("I/O error on {}: {source}", .path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Transient failure: {0}")]
    Retryable(String),

    #[error("Digest mismatch for {}: expected {expected}, got {actual}", .path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("No metadata snapshot found in {}", .0.display())]
    MissingSnapshot(PathBuf),

    #[error("Unreadable metadata snapshot {}: {reason}", .path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("Source and destination are the same path: {}", .0.display())]
    SamePath(PathBuf),

    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("File not found in metadata snapshot: {}", .0.display())]
    NotInSnapshot(PathBuf),

    #[error("File metadata differs from snapshot: {}", .0.display())]
    MetadataMismatch(PathBuf),

    #[error("File content differs from archive: {}", .0.display())]
    ContentMismatch(PathBuf),

    #[error("Duplicate file name in snapshot: {0}")]
    DuplicateEntry(String),

    #[error("No free history name left for {0}")]
    HistoryExhausted(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        EngineError::FileIo {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Transient conditions that the shared retry policy may absorb.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Retryable(_) | EngineError::HashMismatch { .. } => true,
            EngineError::Io(e) | EngineError::FileIo { source: e, .. } => io_is_transient(e),
            _ => false,
        }
    }

    /// Errors that abort the whole directory subtree they occur in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::MissingSnapshot(_)
                | EngineError::CorruptSnapshot { .. }
                | EngineError::SamePath(_)
                | EngineError::DirectoryNotFound(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::Io(e) | EngineError::FileIo { source: e, .. } => {
                e.kind() == io::ErrorKind::Interrupted
                    && e.get_ref().map(|inner| inner.is::<CancelledMarker>()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// True when the underlying I/O error says the target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::Io(e) | EngineError::FileIo { source: e, .. } => {
                e.kind() == io::ErrorKind::NotFound
            }
            EngineError::DirectoryNotFound(_) => true,
            _ => false,
        }
    }

    /// Stable identifier written into the error log.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Io(_) | EngineError::FileIo { .. } => "IoError",
            EngineError::Retryable(_) => "TransientError",
            EngineError::HashMismatch { .. } => "HashMismatch",
            EngineError::MissingSnapshot(_) => "MetadataNotFound",
            EngineError::CorruptSnapshot { .. } => "MetadataCorrupt",
            EngineError::SamePath(_) => "SameSourceAndDestination",
            EngineError::DirectoryNotFound(_) => "DirectoryNotFound",
            EngineError::NotInSnapshot(_) => "FileNotFoundOnMetadata",
            EngineError::MetadataMismatch(_) => "FileMetadataDifferent",
            EngineError::ContentMismatch(_) => "FileDataDifferent",
            EngineError::DuplicateEntry(_) => "DuplicateEntry",
            EngineError::HistoryExhausted(_) => "HistoryNameExhausted",
            EngineError::Crypto(_) => "EncryptionError",
            EngineError::Serialization(_) => "SerializationError",
            EngineError::Config(_) => "ConfigurationError",
            EngineError::Cancelled => "Cancelled",
            EngineError::Task(_) => "TaskFailed",
        }
    }
}

/// Marker carried inside an `io::Error` when a stream adapter observed cancellation.
#[derive(Debug)]
pub(crate) struct CancelledMarker;

impl std::fmt::Display for CancelledMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for CancelledMarker {}

pub(crate) fn cancelled_io() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, CancelledMarker)
}

fn io_is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    ) {
        return true;
    }
    if e.kind() == io::ErrorKind::Interrupted {
        return !e.get_ref().map(|inner| inner.is::<CancelledMarker>()).unwrap_or(false);
    }
    #[cfg(windows)]
    let transient_codes: &[i32] = &[32, 33]; // sharing and lock violations
    #[cfg(not(windows))]
    let transient_codes: &[i32] = &[16]; // EBUSY
    e.raw_os_error().map(|code| transient_codes.contains(&code)).unwrap_or(false)
}

/// Render an error with its source chain. Never panics; a formatter failure yields a
/// placeholder instead.
pub fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = String::new();
    if write!(text, "{}", err).is_err() {
        return "<unprintable error>".to_string();
    }
    let mut source = err.source();
    while let Some(cause) = source {
        let mut rendered = String::new();
        if write!(rendered, "{}", cause).is_err() {
            break;
        }
        if !text.contains(&rendered) {
            text.push_str(": ");
            text.push_str(&rendered);
        }
        source = cause.source();
    }
    if text.is_empty() {
        text.push_str("<no error message>");
    }
    text
}
