//! End-to-end exercise of the provider + cache stack without a real
//! kernel mount (see DESIGN.md for why a live-mount test isn't included).

use std::io::Write;

use fuse_sideload::{BlockCache, CacheError, DataProvider, FileProvider};

fn write_tempfile(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f
}

#[test]
fn file_provider_round_trips_through_the_cache() {
    let block_size = 4096u32;
    let mut contents = Vec::new();
    for block in 0..5u8 {
        contents.extend(std::iter::repeat(block).take(block_size as usize));
    }
    // Final, short block.
    contents.extend(std::iter::repeat(9u8).take(777));

    let f = write_tempfile(&contents);
    let provider = FileProvider::new(f.path(), block_size).unwrap();
    let mut cache = BlockCache::new(provider).unwrap();
    assert_eq!(cache.file_size(), contents.len() as u64);

    // Read spanning the boundary between block 1 and block 2.
    let mut out = vec![0u8; 100];
    cache.read(block_size as u64 * 2 - 50, 100, &mut out).unwrap();
    let mut expected = vec![1u8; 50];
    expected.extend(vec![2u8; 50]);
    assert_eq!(out, expected);

    // Read the short final block, zero-padded past EOF.
    let mut tail = vec![0u8; block_size as usize];
    cache.read(block_size as u64 * 5, block_size, &mut tail).unwrap();
    let mut expected_tail = vec![9u8; 777];
    expected_tail.extend(vec![0u8; block_size as usize - 777]);
    assert_eq!(tail, expected_tail);
}

/// A provider that returns attacker-controlled bytes on the second fetch
/// of a block, simulating a malicious ADB host or a removable block
/// device that changes out from under the installer mid-read.
struct FlipFlopProvider {
    file_size: u64,
    block_size: u32,
    fetches: u32,
}

impl DataProvider for FlipFlopProvider {
    fn read_block_aligned(
        &mut self,
        dest: &mut [u8],
        fetch_size: u32,
        _start_block: u32,
    ) -> std::io::Result<()> {
        let byte = if self.fetches == 0 { b'A' } else { b'B' };
        self.fetches += 1;
        dest[..fetch_size as usize].fill(byte);
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

#[test]
fn a_provider_that_changes_its_answer_is_rejected() {
    let provider = FlipFlopProvider {
        file_size: 8192,
        block_size: 4096,
        fetches: 0,
    };
    let mut cache = BlockCache::new(provider).unwrap();
    let mut out = vec![0u8; 4096];

    cache.read(0, 4096, &mut out).unwrap();
    assert_eq!(out, vec![b'A'; 4096]);

    // Read a different block, then come back, forcing a re-fetch of block 0.
    cache.read(4096, 4096, &mut out).unwrap();
    let err = cache.read(0, 4096, &mut out).unwrap_err();
    assert!(matches!(err, CacheError::Tamper { block: 0 }));
}
