//! `DataProvider` backed by a framed socket to an ADB host (§4.4).

use std::io::{self, Read, Write};

use super::DataProvider;

/// Requests blocks over a byte-stream socket using the trivial
/// 8-ASCII-digit request / raw-payload response protocol described in
/// §6. `S` is generic so tests can substitute an in-memory pipe for a
/// real `UnixStream`.
#[derive(Debug)]
pub struct AdbProvider<S> {
    socket: Option<S>,
    file_size: u64,
    fuse_block_size: u32,
}

impl<S: Read + Write> AdbProvider<S> {
    /// `file_size` and `fuse_block_size` are negotiated out-of-band with
    /// the host before construction (see spec §4.7); this type only
    /// speaks the per-block request/response protocol.
    pub fn new(socket: S, file_size: u64, fuse_block_size: u32) -> Self {
        Self {
            socket: Some(socket),
            file_size,
            fuse_block_size,
        }
    }
}

impl<S: Read + Write> DataProvider for AdbProvider<S> {
    fn read_block_aligned(
        &mut self,
        dest: &mut [u8],
        fetch_size: u32,
        start_block: u32,
    ) -> io::Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        // 8 ASCII digits, zero-padded, no terminator.
        let request = format!("{start_block:08}");
        debug_assert_eq!(request.len(), 8);
        socket.write_all(request.as_bytes())?;
        socket.read_exact(&mut dest[..fetch_size as usize])
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            // Best effort: the host may already have hung up.
            let _ = socket.write_all(b"DONEDONE");
        }
        self.socket = None;
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn fuse_block_size(&self) -> u32 {
        self.fuse_block_size
    }

    fn valid(&self) -> bool {
        self.socket.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockSocket {
        written: Vec<u8>,
        to_read: VecDeque<u8>,
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.to_read.len());
            for b in buf.iter_mut().take(n) {
                *b = self.to_read.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sends_zero_padded_decimal_block_index() {
        let mut sock = MockSocket::default();
        sock.to_read.extend(std::iter::repeat(b'x').take(4096));
        let mut provider = AdbProvider::new(sock, 1 << 20, 4096);
        let mut buf = [0u8; 4096];
        provider.read_block_aligned(&mut buf, 4096, 42).unwrap();
        assert_eq!(provider.socket.as_ref().unwrap().written, b"00000042");
        assert_eq!(buf, [b'x'; 4096]);
    }

    #[test]
    fn close_sends_donedone() {
        let sock = MockSocket::default();
        let mut provider = AdbProvider::new(sock, 0, 4096);
        provider.close();
        assert!(!provider.valid());
    }
}
