//! Content digests recorded in snapshots as `algo:hex`.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256 (cryptographic, 256-bit)
    #[default]
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(EngineError::Config(format!("unknown hash algorithm '{}'", other))),
        }
    }
}

impl HashAlgorithm {
    /// Algorithm named by the prefix of a recorded digest string.
    pub fn of_digest(digest: &str) -> Option<Self> {
        let (algo, _) = digest.split_once(':')?;
        algo.parse().ok()
    }
}

/// Incremental hasher for either algorithm.
pub enum Hasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and format as `algo:hex`.
    pub fn finalize(self) -> String {
        match self {
            Hasher::Sha256(h) => format!("{}:{:x}", HashAlgorithm::Sha256, h.finalize()),
            Hasher::Blake3(h) => format!("{}:{}", HashAlgorithm::Blake3, h.finalize().to_hex()),
        }
    }
}

/// Digest everything `reader` yields.
pub async fn digest_reader<R>(
    reader: &mut R,
    algorithm: HashAlgorithm,
    cancel: &CancellationToken,
) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            r = reader.read(&mut buf) => r?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
