//! `DataProvider` backed by a rangeset of blocks on a block device (§4.3).

use std::fs::File;
use std::io::{self, BufRead};
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::DataProvider;
use crate::error::ConfigError;

/// A half-open rangeset of `[start, end)` intervals over a block device,
/// expressed in units of the device's own block size. The ranges are
/// walked in declaration order to map the virtual file's source blocks
/// onto device blocks, matching `update_engine`'s `RangeSet` convention.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    fn total_blocks(&self) -> u64 {
        self.ranges.iter().map(|&(s, e)| e - s).sum()
    }

    /// Maps `count` consecutive source-blocks of the virtual file,
    /// starting at the `start`-th source-block overall, onto device-block
    /// sub-ranges, preserving order. Returns `None` if `start + count`
    /// runs past the end of the rangeset.
    fn sub_ranges(&self, start: u64, count: u64) -> Option<Vec<(u64, u64)>> {
        let mut out = Vec::new();
        let mut skipped = 0u64;
        let mut remaining = count;
        for &(rstart, rend) in &self.ranges {
            if remaining == 0 {
                break;
            }
            let rlen = rend - rstart;
            if skipped + rlen <= start {
                skipped += rlen;
                continue;
            }
            let offset_in_range = start.saturating_sub(skipped);
            let avail = rlen - offset_in_range;
            let take = avail.min(remaining);
            let dev_start = rstart + offset_in_range;
            out.push((dev_start, dev_start + take));
            remaining -= take;
            skipped += rlen;
        }
        if remaining > 0 { None } else { Some(out) }
    }
}

struct BlockMapFile {
    device_path: std::path::PathBuf,
    file_size: u64,
    source_block_size: u32,
    ranges: RangeSet,
}

fn parse_block_map(path: impl AsRef<Path>) -> Result<BlockMapFile, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();

    let device_path = lines
        .next()
        .ok_or_else(|| ConfigError::InvalidBlockMap("missing device path line".into()))?
        .to_string();

    let sizes_line = lines
        .next()
        .ok_or_else(|| ConfigError::InvalidBlockMap("missing file_size/block_size line".into()))?;
    let mut sizes = sizes_line.split_whitespace();
    let file_size: u64 = sizes
        .next()
        .ok_or_else(|| ConfigError::InvalidBlockMap("missing file_size".into()))?
        .parse()
        .map_err(|_| ConfigError::InvalidBlockMap("file_size is not a u64".into()))?;
    let source_block_size: u32 = sizes
        .next()
        .ok_or_else(|| ConfigError::InvalidBlockMap("missing source block size".into()))?
        .parse()
        .map_err(|_| ConfigError::InvalidBlockMap("source block size is not a u32".into()))?;

    let range_count: u32 = lines
        .next()
        .ok_or_else(|| ConfigError::InvalidBlockMap("missing range count line".into()))?
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidBlockMap("range count is not a u32".into()))?;

    let mut ranges = Vec::with_capacity(range_count as usize);
    for _ in 0..range_count {
        let line = lines
            .next()
            .ok_or_else(|| ConfigError::InvalidBlockMap("fewer ranges than range_count".into()))?;
        let mut parts = line.split_whitespace();
        let start: u64 = parts
            .next()
            .ok_or_else(|| ConfigError::InvalidBlockMap("missing range start".into()))?
            .parse()
            .map_err(|_| ConfigError::InvalidBlockMap("range start is not a u64".into()))?;
        let end: u64 = parts
            .next()
            .ok_or_else(|| ConfigError::InvalidBlockMap("missing range end".into()))?
            .parse()
            .map_err(|_| ConfigError::InvalidBlockMap("range end is not a u64".into()))?;
        if end <= start {
            return Err(ConfigError::InvalidBlockMap(format!(
                "range [{start}, {end}) is not a valid half-open interval"
            )));
        }
        ranges.push((start, end));
    }

    Ok(BlockMapFile {
        device_path: device_path.into(),
        file_size,
        source_block_size,
        ranges: RangeSet { ranges },
    })
}

/// Reads the virtual file's bytes out of a rangeset of blocks on a block
/// device, as described by a textual block-map file (§4.3).
#[derive(Debug)]
pub struct BlockMapProvider {
    device: Option<File>,
    file_size: u64,
    fuse_block_size: u32,
    source_block_size: u32,
    ranges: RangeSet,
}

impl BlockMapProvider {
    /// Parses `block_map_path` and opens the device it names.
    pub fn new(block_map_path: impl AsRef<Path>, fuse_block_size: u32) -> Result<Self, ConfigError> {
        let parsed = parse_block_map(block_map_path)?;
        if fuse_block_size % parsed.source_block_size != 0 {
            return Err(ConfigError::BlockSizeMismatch {
                source: parsed.source_block_size,
                fuse: fuse_block_size,
            });
        }
        let device = File::open(&parsed.device_path)?;
        Ok(Self {
            device: Some(device),
            file_size: parsed.file_size,
            fuse_block_size,
            source_block_size: parsed.source_block_size,
            ranges: parsed.ranges,
        })
    }
}

impl DataProvider for BlockMapProvider {
    fn read_block_aligned(
        &mut self,
        dest: &mut [u8],
        fetch_size: u32,
        start_block: u32,
    ) -> io::Result<()> {
        let Some(device) = self.device.as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let fuse_block_size = u64::from(self.fuse_block_size);
        let source_block_size = u64::from(self.source_block_size);
        let offset = u64::from(start_block) * fuse_block_size;
        if u64::from(fetch_size) > self.file_size || offset > self.file_size - u64::from(fetch_size)
        {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "out of bound read: offset={offset}, fetch_size={fetch_size}, file_size={}",
                    self.file_size
                ),
            ));
        }

        let start_source_block = offset / source_block_size;
        let whole_blocks = u64::from(fetch_size) / source_block_size;
        let tail_bytes = u64::from(fetch_size) % source_block_size;

        let read_ranges = self
            .ranges
            .sub_ranges(start_source_block, whole_blocks)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "rangeset exhausted before fetch_size")
            })?;

        let mut next_out = 0usize;
        for &(rstart, rend) in &read_ranges {
            let bytes_start = rstart * source_block_size;
            let bytes_to_read = ((rend - rstart) * source_block_size) as usize;
            device.read_exact_at(&mut dest[next_out..next_out + bytes_to_read], bytes_start)?;
            next_out += bytes_to_read;
        }

        if tail_bytes > 0 {
            let tail_block = self
                .ranges
                .sub_ranges(start_source_block + whole_blocks, 1)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "rangeset exhausted before fetch_size")
                })?;
            let tail_offset = tail_block[0].0 * source_block_size;
            device.read_exact_at(&mut dest[next_out..next_out + tail_bytes as usize], tail_offset)?;
        }

        Ok(())
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn fuse_block_size(&self) -> u32 {
        self.fuse_block_size
    }

    fn valid(&self) -> bool {
        self.device.is_some()
    }
}
