#![forbid(unsafe_code)]
//! Error types for ext4salvage.
//!
//! Defines `SalvageError` and a `Result<T>` alias used throughout the
//! workspace. Damage discovered inside the image is *not* an error: views,
//! extents, and file nodes carry their own `ok` flags and the scan keeps
//! going. `SalvageError` is reserved for conditions that stop an operation
//! (I/O failure, an unusable superblock, malformed auxiliary files).

use e4s_types::ParseError;
use thiserror::Error;

/// Unified error type for all ext4salvage operations.
#[derive(Debug, Error)]
pub enum SalvageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad superblock: {reason}")]
    BadSuperblock { reason: &'static str },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("invalid inode number {ino}")]
    InvalidInode { ino: u32 },

    #[error("position {pos} is outside the damage map")]
    OutOfRange { pos: u64 },

    #[error("tree cache unusable: {0}")]
    CacheFormat(String),
}

/// Result alias using `SalvageError`.
pub type Result<T> = std::result::Result<T, SalvageError>;
