//! Data sources behind the block cache.
//!
//! A `DataProvider` is a block-aligned byte source: the cache calls
//! `read_block_aligned` for whole blocks only and owns all finer-grained
//! slicing itself.

mod adb;
mod block_map;
mod file;

pub use adb::AdbProvider;
pub use block_map::{BlockMapProvider, RangeSet};
pub use file::FileProvider;

use std::io;

/// Block-aligned byte source for the sideload filesystem's virtual file.
///
/// Implementations are single-consumer: the `BlockCache` holds the only
/// reference and calls `close` exactly once, at shutdown.
pub trait DataProvider {
    /// Fills `dest[0..fetch_size]` with bytes starting at file offset
    /// `start_block * fuse_block_size()`. `fetch_size` is always
    /// `<= fuse_block_size()`. A short read is an error.
    fn read_block_aligned(
        &mut self,
        dest: &mut [u8],
        fetch_size: u32,
        start_block: u32,
    ) -> io::Result<()>;

    /// Releases the underlying resource. Idempotent.
    fn close(&mut self);

    /// Total size of the virtual file, in bytes.
    fn file_size(&self) -> u64;

    /// Block size this provider was constructed with.
    fn fuse_block_size(&self) -> u32;

    /// Whether construction succeeded.
    fn valid(&self) -> bool;
}
