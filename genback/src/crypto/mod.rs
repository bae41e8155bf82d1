//! Password-based content encryption for archived blobs.
//!
//! Blob layout: a fixed header followed by AES-256-GCM frames. Each frame is a
//! big-endian `u32` length (top bit set on the final frame) and the sealed bytes.
//! Frames are at most 64 KiB of plaintext, so neither side ever materializes a whole
//! file. The header is authenticated as associated data of every frame and the final
//! flag is part of the nonce, so truncation and header tampering are both detected.
//!
//! ```text
//! magic(8) | flags(1) | kdf memory KiB(4) | kdf iterations(4) | salt(16) | nonce prefix(7)
//! ```

mod stream;

pub use stream::read_full;

use crate::utils::errors::{EngineError, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Suffix appended to the stored name of an encrypted blob.
pub const ENCRYPTED_SUFFIX: &str = ".genc";

const MAGIC: &[u8; 8] = b"GENBACK1";
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = 8 + 1 + 4 + 4 + SALT_LEN + NONCE_PREFIX_LEN;
const FRAME_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const FINAL_FLAG: u32 = 1 << 31;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Argon2id cost parameters, recorded in every blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 19456 = 19 MiB)
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,

    /// Time cost (iterations, default: 2)
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

fn default_memory_kib() -> u32 {
    19_456
}

fn default_iterations() -> u32 {
    2
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
        }
    }
}

/// Stored name of a file: encrypted blobs carry `ENCRYPTED_SUFFIX`.
pub fn stored_name(name: &str, encrypted: bool) -> String {
    if encrypted {
        format!("{}{}", name, ENCRYPTED_SUFFIX)
    } else {
        name.to_string()
    }
}

pub fn is_encrypted_name(stored: &str) -> bool {
    stored.len() > ENCRYPTED_SUFFIX.len() && stored.ends_with(ENCRYPTED_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    compressed: bool,
    params: KdfParams,
    salt: [u8; SALT_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(MAGIC);
        out[8] = if self.compressed { FLAG_COMPRESSED } else { 0 };
        out[9..13].copy_from_slice(&self.params.memory_kib.to_be_bytes());
        out[13..17].copy_from_slice(&self.params.iterations.to_be_bytes());
        out[17..17 + SALT_LEN].copy_from_slice(&self.salt);
        out[17 + SALT_LEN..].copy_from_slice(&self.nonce_prefix);
        out
    }

    fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        if &bytes[..8] != MAGIC {
            return Err(EngineError::Crypto("not an encrypted blob (bad magic)".into()));
        }
        if bytes[8] & !FLAG_COMPRESSED != 0 {
            return Err(EngineError::Crypto(format!("unknown blob flags {:#04x}", bytes[8])));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[9..13]);
        let memory_kib = u32::from_be_bytes(word);
        word.copy_from_slice(&bytes[13..17]);
        let iterations = u32::from_be_bytes(word);

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[17..17 + SALT_LEN]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&bytes[17 + SALT_LEN..]);

        Ok(Self {
            compressed: bytes[8] & FLAG_COMPRESSED != 0,
            params: KdfParams {
                memory_kib,
                iterations,
            },
            salt,
            nonce_prefix,
        })
    }
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Keys derived from one named password.
///
/// Blobs written by one suite share a salt, so a run derives its write key once;
/// blobs from earlier runs carry their own salt and are derived on first use.
pub struct CipherSuite {
    password: Vec<u8>,
    params: KdfParams,
    write_salt: [u8; SALT_LEN],
    ciphers: Mutex<HashMap<([u8; SALT_LEN], KdfParams), Aes256Gcm>>,
}

impl CipherSuite {
    pub fn new(password: &str, params: KdfParams) -> Result<Self> {
        if password.is_empty() {
            return Err(EngineError::Config("encryption password is empty".into()));
        }
        let mut write_salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut write_salt);
        Ok(Self {
            password: password.as_bytes().to_vec(),
            params,
            write_salt,
            ciphers: Mutex::new(HashMap::new()),
        })
    }

    async fn cipher_for(&self, salt: [u8; SALT_LEN], params: KdfParams) -> Result<Aes256Gcm> {
        if let Some(cipher) = self.lock_ciphers().get(&(salt, params)) {
            return Ok(cipher.clone());
        }

        let password = self.password.clone();
        let cipher = tokio::task::spawn_blocking(move || derive_cipher(password, &salt, params))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;

        self.lock_ciphers().insert((salt, params), cipher.clone());
        Ok(cipher)
    }

    fn lock_ciphers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<([u8; SALT_LEN], KdfParams), Aes256Gcm>> {
        match self.ciphers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for CipherSuite {
    fn drop(&mut self) {
        // Zero out the password when dropped
        self.password.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSuite")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn derive_cipher(mut password: Vec<u8>, salt: &[u8], params: KdfParams) -> Result<Aes256Gcm> {
    let argon_params = Params::new(params.memory_kib, params.iterations, 1, Some(32))
        .map_err(|e| EngineError::Crypto(format!("invalid key derivation parameters: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = [0u8; 32];
    let derived = argon
        .hash_password_into(&password, salt, &mut key)
        .map_err(|e| EngineError::Crypto(format!("key derivation failed: {}", e)));
    password.iter_mut().for_each(|b| *b = 0);
    derived?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| EngineError::Crypto(format!("failed to create cipher: {}", e)));
    key.iter_mut().for_each(|b| *b = 0);
    cipher
}
