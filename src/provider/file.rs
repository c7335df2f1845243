//! `DataProvider` backed by a regular file (§4.2).

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::DataProvider;

/// Reads the virtual file's bytes from a local regular file via `pread`.
#[derive(Debug)]
pub struct FileProvider {
    file: Option<File>,
    file_size: u64,
    fuse_block_size: u32,
}

impl FileProvider {
    /// Opens `path` read-only and stats it to discover `file_size`.
    ///
    /// Returns an error (and leaves `valid() == false`, matching the
    /// original `FuseFileDataProvider`'s two-step construction) if either
    /// the `stat` or the `open` fails.
    pub fn new(path: impl AsRef<Path>, fuse_block_size: u32) -> io::Result<Self> {
        let path = path.as_ref();
        let file_size = std::fs::metadata(path)?.len();
        let file = File::open(path)?;
        Ok(Self {
            file: Some(file),
            file_size,
            fuse_block_size,
        })
    }
}

impl DataProvider for FileProvider {
    fn read_block_aligned(
        &mut self,
        dest: &mut [u8],
        fetch_size: u32,
        start_block: u32,
    ) -> io::Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let offset = u64::from(start_block) * u64::from(self.fuse_block_size);
        if u64::from(fetch_size) > self.file_size || offset > self.file_size - u64::from(fetch_size)
        {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "out of bound read: start_block={start_block}, fetch_size={fetch_size}, file_size={}",
                    self.file_size
                ),
            ));
        }
        file.read_exact_at(&mut dest[..fetch_size as usize], offset)
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn fuse_block_size(&self) -> u32 {
        self.fuse_block_size
    }

    fn valid(&self) -> bool {
        self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_whole_blocks() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[7u8; 100]).unwrap();
        let mut provider = FileProvider::new(f.path(), 64).unwrap();
        assert_eq!(provider.file_size(), 100);
        let mut buf = [0u8; 64];
        provider.read_block_aligned(&mut buf, 64, 0).unwrap();
        assert_eq!(buf, [7u8; 64]);
    }

    #[test]
    fn rejects_out_of_bounds_fetch() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(10).unwrap();
        let mut provider = FileProvider::new(f.path(), 64).unwrap();
        let mut buf = [0u8; 64];
        assert!(provider.read_block_aligned(&mut buf, 64, 0).is_err());
    }

    #[test]
    fn missing_file_is_invalid() {
        assert!(FileProvider::new("/nonexistent/path/for/test", 4096).is_err());
    }
}
