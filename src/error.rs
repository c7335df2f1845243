//! Error taxonomy for the sideload core.
//!
//! Construction-time failures (`ConfigError`) never touch the mountpoint.
//! Per-read failures (`CacheError`) surface only as an errno on the FUSE
//! channel; nothing here is meant to be shown to a user.

use std::fmt;
use std::io;

/// Failure while constructing a provider, cache, or mount.
#[derive(Debug)]
pub enum ConfigError {
    /// Requested block size is below the 1 KiB floor.
    BlockSizeTooSmall(u32),
    /// Requested block size is above the 4 MiB ceiling.
    BlockSizeTooLarge(u32),
    /// `n_blocks` exceeds 2^18.
    TooManyBlocks(u64),
    /// A block-map's source block size does not divide the fuse block size.
    BlockSizeMismatch { source: u32, fuse: u32 },
    /// Malformed block-map file.
    InvalidBlockMap(String),
    /// Underlying OS error (open, stat, mount, ...).
    Io(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockSizeTooSmall(b) => write!(f, "block size {b} is too small (min 1024)"),
            Self::BlockSizeTooLarge(b) => {
                write!(f, "block size {b} is too large (max {})", 4 << 20)
            }
            Self::TooManyBlocks(n) => write!(f, "file has too many blocks ({n}, max {})", 1 << 18),
            Self::BlockSizeMismatch { source, fuse } => write!(
                f,
                "source block size {source} does not divide fuse block size {fuse}"
            ),
            Self::InvalidBlockMap(msg) => write!(f, "invalid block map: {msg}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Failure while serving a single `BlockCache::read`.
#[derive(Debug)]
pub enum CacheError {
    /// The provider failed to deliver the requested bytes.
    Io(io::Error),
    /// The provider returned bytes that disagree with the hash pinned on
    /// an earlier fetch of the same block.
    Tamper {
        /// Index of the block whose hash disagreed.
        block: u32,
    },
}

impl CacheError {
    /// errno to surface to the FUSE kernel channel for this failure.
    pub fn errno(&self) -> i32 {
        libc::EIO
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "block fetch failed: {e}"),
            Self::Tamper { block } => {
                write!(f, "block {block} hash mismatch: provider returned different bytes than on first fetch")
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Tamper { .. } => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
