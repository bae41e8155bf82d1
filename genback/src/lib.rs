//! genback library
//!
//! Generational directory backup, restore and verify over pluggable storage
//! providers, with per-directory metadata snapshots and optional encryption.

pub mod config;
pub mod crypto;
pub mod executor;
pub mod fs;
pub mod shutdown;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{EncryptionOptions, Engine, Options, RestorePolicy};
pub use transfer::StatsSnapshot;
pub use utils::errors::{EngineError, Result};
