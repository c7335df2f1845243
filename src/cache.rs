//! The verified block cache (§4.5, C5).
//!
//! Pages the virtual file in block-sized chunks, pinning each block's
//! SHA-256 the first time it is fetched and rejecting any later fetch
//! that disagrees — the read-stability invariant (P1) that closes the
//! signature-verify-then-install TOCTOU hole.

use sha2::{Digest, Sha256};

use crate::error::{CacheError, ConfigError};
use crate::provider::DataProvider;

const MIN_BLOCK_SIZE: u32 = 1024;
const MAX_BLOCK_SIZE: u32 = 4 << 20;
const MAX_BLOCKS: u64 = 1 << 18;

/// Block-paged, hash-pinned cache over a single `DataProvider`.
///
/// Single-threaded: there is no locking because the cache is never
/// shared across threads (the FUSE server drives one request to
/// completion before reading the next).
pub struct BlockCache<P> {
    provider: P,
    file_size: u64,
    block_size: u32,
    n_blocks: u32,
    current_block: Option<u32>,
    block_buf: Vec<u8>,
    extra_buf: Vec<u8>,
    hashes: Vec<[u8; 32]>,
}

impl<P: DataProvider> BlockCache<P> {
    /// Builds a cache over `provider`, rejecting out-of-range block
    /// sizes and files with too many blocks before any allocation.
    pub fn new(provider: P) -> Result<Self, ConfigError> {
        let block_size = provider.fuse_block_size();
        if block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeTooSmall(block_size));
        }
        if block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeTooLarge(block_size));
        }

        let file_size = provider.file_size();
        let n_blocks = if file_size == 0 {
            0
        } else {
            (file_size - 1) / u64::from(block_size) + 1
        };
        if n_blocks > MAX_BLOCKS {
            return Err(ConfigError::TooManyBlocks(n_blocks));
        }
        debug_assert!(file_size <= n_blocks * u64::from(block_size));

        Ok(Self {
            provider,
            file_size,
            block_size,
            n_blocks: n_blocks as u32,
            current_block: None,
            block_buf: vec![0u8; block_size as usize],
            extra_buf: vec![0u8; block_size as usize],
            hashes: vec![[0u8; 32]; n_blocks as usize],
        })
    }

    /// Total size of the virtual file, in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Block size the cache pages in.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Releases the underlying provider. Idempotent.
    pub fn close(&mut self) {
        self.provider.close();
    }

    /// Fills `out[0..size]` with file bytes starting at `offset`,
    /// zero-padding past `file_size`. Because the mount sets
    /// `max_read = block_size`, a single call here covers at most two
    /// consecutive blocks.
    pub fn read(&mut self, offset: u64, size: u32, out: &mut [u8]) -> Result<(), CacheError> {
        let first = (offset / u64::from(self.block_size)) as u32;
        let off_in_first = (offset % u64::from(self.block_size)) as u32;

        self.fetch_block(first)?;

        if off_in_first + size <= self.block_size {
            let start = off_in_first as usize;
            out[..size as usize].copy_from_slice(&self.block_buf[start..start + size as usize]);
            return Ok(());
        }

        let tail_len = (self.block_size - off_in_first) as usize;
        self.extra_buf[..tail_len].copy_from_slice(&self.block_buf[off_in_first as usize..]);

        self.fetch_block(first + 1)?;

        out[..tail_len].copy_from_slice(&self.extra_buf[..tail_len]);
        let head_len = size as usize - tail_len;
        out[tail_len..tail_len + head_len].copy_from_slice(&self.block_buf[..head_len]);
        Ok(())
    }

    /// Ensures `block_buf` holds block `i`, fetching and pinning it if
    /// necessary (§4.5 algorithm).
    fn fetch_block(&mut self, i: u32) -> Result<(), CacheError> {
        if self.current_block == Some(i) {
            return Ok(());
        }

        if i >= self.n_blocks {
            self.block_buf.fill(0);
            self.current_block = Some(i);
            return Ok(());
        }

        let valid_len =
            (u64::from(self.block_size)).min(self.file_size - u64::from(i) * u64::from(self.block_size));
        let valid_len = valid_len as usize;
        self.block_buf[valid_len..].fill(0);

        if let Err(e) = self
            .provider
            .read_block_aligned(&mut self.block_buf[..valid_len], valid_len as u32, i)
        {
            self.current_block = None;
            return Err(CacheError::Io(e));
        }

        let digest = Sha256::digest(&self.block_buf[..valid_len]);
        let pinned = &mut self.hashes[i as usize];

        if digest.as_slice() == pinned.as_slice() {
            self.current_block = Some(i);
            return Ok(());
        }

        if pinned.iter().all(|&b| b == 0) {
            pinned.copy_from_slice(&digest);
            self.current_block = Some(i);
            return Ok(());
        }

        self.current_block = None;
        Err(CacheError::Tamper { block: i })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// A provider whose per-block response can be scripted, for testing
    /// tamper detection and at-most-once-fetch behavior.
    struct ScriptedProvider {
        file_size: u64,
        block_size: u32,
        responses: std::collections::HashMap<u32, VecDeque<Vec<u8>>>,
        fetch_counts: std::rc::Rc<std::cell::RefCell<std::collections::HashMap<u32, u32>>>,
    }

    impl ScriptedProvider {
        fn new(file_size: u64, block_size: u32) -> Self {
            Self {
                file_size,
                block_size,
                responses: Default::default(),
                fetch_counts: Default::default(),
            }
        }

        fn script(&mut self, block: u32, bytes: Vec<u8>) {
            self.responses.entry(block).or_default().push_back(bytes);
        }

        /// A handle that keeps reporting per-block fetch counts after the
        /// provider itself has been moved into a `BlockCache`.
        fn fetch_counts_handle(
            &self,
        ) -> std::rc::Rc<std::cell::RefCell<std::collections::HashMap<u32, u32>>> {
            self.fetch_counts.clone()
        }
    }

    impl DataProvider for ScriptedProvider {
        fn read_block_aligned(
            &mut self,
            dest: &mut [u8],
            fetch_size: u32,
            start_block: u32,
        ) -> io::Result<()> {
            *self
                .fetch_counts
                .borrow_mut()
                .entry(start_block)
                .or_insert(0) += 1;
            let queue = self.responses.get_mut(&start_block).expect("unscripted block");
            let bytes = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().unwrap().clone()
            };
            assert_eq!(bytes.len(), fetch_size as usize);
            dest.copy_from_slice(&bytes);
            Ok(())
        }

        fn close(&mut self) {}
        fn file_size(&self) -> u64 {
            self.file_size
        }
        fn fuse_block_size(&self) -> u32 {
            self.block_size
        }
        fn valid(&self) -> bool {
            true
        }
    }

    fn filled(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    #[test]
    fn single_block_read() {
        let mut provider = ScriptedProvider::new(16384, 4096);
        for (i, b) in [b'a', b'b', b'c', b'd'].into_iter().enumerate() {
            provider.script(i as u32, filled(b, 4096));
        }
        let mut cache = BlockCache::new(provider).unwrap();

        let mut out = vec![0u8; 2000];
        cache.read(4096, 2000, &mut out).unwrap();
        assert_eq!(out, filled(b'c', 2000));
    }

    #[test]
    fn two_block_spanning_read() {
        let mut provider = ScriptedProvider::new(16384, 4096);
        for (i, b) in [b'a', b'b', b'c', b'd'].into_iter().enumerate() {
            provider.script(i as u32, filled(b, 4096));
        }
        let mut cache = BlockCache::new(provider).unwrap();

        let mut out = vec![0u8; 3000];
        cache.read(6000, 3000, &mut out).unwrap();
        let mut expected = filled(b'c', 96);
        expected.extend(filled(b'd', 2048));
        expected.extend(filled(b'e', 856));
        assert_eq!(out, expected);
    }

    #[test]
    fn short_final_block_zero_pads() {
        let mut provider = ScriptedProvider::new(10_000, 4096);
        provider.script(0, filled(1, 4096));
        provider.script(1, filled(2, 4096));
        provider.script(2, filled(3, 10_000 - 2 * 4096)); // 1808 valid bytes
        let mut cache = BlockCache::new(provider).unwrap();

        let mut out = vec![0u8; 4096];
        cache.read(8192, 4096, &mut out).unwrap();
        let mut expected = filled(3, 1808);
        expected.extend(filled(0, 4096 - 1808));
        assert_eq!(out, expected);
    }

    #[test]
    fn read_past_eof_returns_zeros() {
        let provider = ScriptedProvider::new(0, 4096);
        let mut cache = BlockCache::new(provider).unwrap();
        let mut out = vec![0xffu8; 100];
        cache.read(5000, 100, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 100]);
    }

    #[test]
    fn at_most_one_fetch_per_block() {
        let mut provider = ScriptedProvider::new(8192, 4096);
        provider.script(0, filled(1, 4096));
        provider.script(1, filled(2, 4096));
        let counts = provider.fetch_counts_handle();
        let mut cache = BlockCache::new(provider).unwrap();

        let mut out = vec![0u8; 100];
        // Three reads that all land in block 0.
        cache.read(0, 100, &mut out).unwrap();
        cache.read(50, 100, &mut out).unwrap();
        cache.read(0, 100, &mut out).unwrap();
        // A read spanning blocks 0 and 1, re-fetching block 0 (still hot)
        // and fetching block 1 for the first time.
        cache.read(4000, 200, &mut vec![0u8; 200]).unwrap();

        assert_eq!(counts.borrow().get(&0).copied(), Some(1));
        assert_eq!(counts.borrow().get(&1).copied(), Some(1));
    }

    #[test]
    fn tamper_detection_fails_second_divergent_read() {
        let mut provider = ScriptedProvider::new(16384, 4096);
        provider.script(0, filled(b'a', 4096));
        // Block 2 returns "X" the first time, "Y" on every later fetch.
        provider.responses.insert(2, VecDeque::from([filled(b'X', 4096), filled(b'Y', 4096)]));
        provider.script(1, filled(b'b', 4096));
        provider.script(3, filled(b'd', 4096));

        let mut cache = BlockCache::new(provider).unwrap();
        let mut out = vec![0u8; 4096];

        // First read of block 2 pins the "X" hash.
        cache.read(8192, 4096, &mut out).unwrap();
        assert_eq!(out, filled(b'X', 4096));

        // Evict block 2 from the single-slot current_block cache.
        cache.read(0, 4096, &mut out).unwrap();

        // Second read of block 2 now gets "Y" from the provider: tamper.
        let err = cache.read(8192, 4096, &mut out).unwrap_err();
        assert!(matches!(err, CacheError::Tamper { block: 2 }));
    }

    #[test]
    fn rejects_block_size_out_of_range() {
        let too_small = ScriptedProvider::new(100, 512);
        assert!(matches!(
            BlockCache::new(too_small),
            Err(ConfigError::BlockSizeTooSmall(512))
        ));

        let too_large = ScriptedProvider::new(100, (4 << 20) + 1);
        assert!(matches!(
            BlockCache::new(too_large),
            Err(ConfigError::BlockSizeTooLarge(_))
        ));
    }

    #[test]
    fn rejects_too_many_blocks() {
        // 2^18 + 1 blocks at the minimum block size.
        let file_size = (MAX_BLOCKS + 1) * u64::from(MIN_BLOCK_SIZE);
        let provider = ScriptedProvider::new(file_size, MIN_BLOCK_SIZE);
        assert!(matches!(
            BlockCache::new(provider),
            Err(ConfigError::TooManyBlocks(_))
        ));
    }
}
