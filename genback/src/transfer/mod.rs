//! Byte movement: copying, comparing, hashing and counting.

pub mod compare;
pub mod copy;
pub mod digest;
pub mod metered;
pub mod stats;

pub use compare::contents_equal;
pub use copy::{copy_file, CopyOptions, CopyOutcome, Transform};
pub use digest::HashAlgorithm;
pub use stats::{Stats, StatsSnapshot};
