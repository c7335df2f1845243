//! The FUSE request loop and per-opcode dispatch (§4.6, C6).
//!
//! No libfuse: requests are read directly off the `/dev/fuse` fd this
//! module owns, parsed against the layouts in [`crate::abi`], and replied
//! to with a single `writev` so the kernel never observes a partial
//! header+payload.

use std::io::{self, IoSlice, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::{debug, error, warn};
use smallvec::{smallvec, SmallVec};
use zerocopy::{FromBytes, IntoBytes};

use crate::abi::{
    FuseAttr, FuseAttrOut, FuseEntryOut, FuseInHeader, FuseInitIn, FuseInitOut, FuseOpenOut,
    FuseOutHeader, FuseReadIn, Opcode, FUSE_COMPAT_22_INIT_OUT_SIZE, FUSE_KERNEL_MINOR_VERSION,
    FUSE_KERNEL_VERSION, FUSE_ROOT_ID,
};
use crate::cache::BlockCache;
use crate::channel::{mount_sideload, unmount_sideload, DevFuse};
use crate::provider::DataProvider;

const PATH_MAX: usize = 4096;
const NODE_PACKAGE: u64 = FUSE_ROOT_ID + 1;
const NODE_EXIT: u64 = FUSE_ROOT_ID + 2;
const ENTRY_VALID_SECS: u64 = 10;
const PACKAGE_FH: u64 = 10;

/// What a per-opcode handler did with the request, so the loop writes
/// at most one reply per `unique`.
enum Disposition {
    /// The handler already wrote a reply (success or embedded error).
    Replied,
    /// The handler wrote a reply and the server should now tear down.
    RepliedThenShutdown,
    /// The handler wrote nothing; the loop writes a bare error reply.
    Error(i32),
}

/// Drives one mounted FUSE channel, backed by a single [`BlockCache`].
pub struct FuseServer<P> {
    fuse_fd: DevFuse,
    mountpoint: std::path::PathBuf,
    cache: BlockCache<P>,
    block_size: u32,
}

impl<P: DataProvider> FuseServer<P> {
    /// Mounts `mountpoint` and builds the cache over `provider`.
    pub fn mount(mountpoint: impl AsRef<Path>, provider: P) -> io::Result<Self> {
        let mountpoint = mountpoint.as_ref().to_path_buf();
        let cache = BlockCache::new(provider)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let block_size = cache.block_size();
        let fuse_fd = mount_sideload(&mountpoint, block_size)?;
        Ok(Self {
            fuse_fd,
            mountpoint,
            cache,
            block_size,
        })
    }

    /// Path of the mounted filesystem.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Runs the request loop until unmounted or the `exit` node is stat'd.
    ///
    /// Blocks the calling thread; callers that want this to run
    /// concurrently with other work (e.g. the orchestrator's polling
    /// parent) should call this from a forked child.
    pub fn run(&mut self) {
        let mut buf = vec![0u8; size_of::<FuseInHeader>() + 8 * PATH_MAX];
        loop {
            let n = match self.read_request(&mut buf) {
                Ok(None) => break,
                Ok(Some(n)) => n,
                Err(()) => continue,
            };

            if n < size_of::<FuseInHeader>() {
                warn!("short read from /dev/fuse: {n} bytes");
                continue;
            }

            let Ok((header, body)) = FuseInHeader::ref_from_prefix(&buf[..n]) else {
                warn!("malformed fuse_in_header");
                continue;
            };
            let header = *header;

            let disposition = match Opcode::try_from(header.opcode) {
                Ok(op) => self.dispatch(op, &header, body),
                Err(()) => {
                    debug!("unsupported opcode {}", header.opcode);
                    Disposition::Error(libc::ENOSYS)
                }
            };

            match disposition {
                Disposition::Replied => continue,
                Disposition::RepliedThenShutdown => break,
                Disposition::Error(errno) => {
                    if let Err(e) = self.reply_error(header.unique, errno) {
                        error!("failed writing error reply: {e}");
                    }
                }
            }
        }
        self.shutdown();
    }

    fn read_request(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ()> {
        loop {
            match (&self.fuse_fd.0).read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => return Ok(None),
                Err(e) => {
                    error!("read(/dev/fuse) failed: {e}");
                    return Err(());
                }
            }
        }
    }

    fn dispatch(&mut self, op: Opcode, header: &FuseInHeader, body: &[u8]) -> Disposition {
        debug!("dispatch {:?} nodeid={}", op, header.nodeid);
        match op {
            Opcode::FuseInit => self.handle_init(header, body),
            Opcode::FuseLookup => self.handle_lookup(header, body),
            Opcode::FuseGetattr => self.handle_getattr(header),
            Opcode::FuseOpen => self.handle_open(header),
            Opcode::FuseRead => self.handle_read(header, body),
            Opcode::FuseFlush => self.reply_ok(header.unique),
            Opcode::FuseRelease => self.reply_ok(header.unique),
            Opcode::FuseForget => Disposition::Replied,
            Opcode::FuseDestroy => Disposition::RepliedThenShutdown,
        }
    }

    fn handle_init(&mut self, header: &FuseInHeader, body: &[u8]) -> Disposition {
        let Ok(init_in) = FuseInitIn::ref_from_bytes(&body[..size_of::<FuseInitIn>().min(body.len())])
        else {
            return Disposition::Error(libc::EINVAL);
        };
        if init_in.major != FUSE_KERNEL_VERSION || init_in.minor < 6 {
            warn!(
                "unsupported kernel fuse version {}.{}",
                init_in.major, init_in.minor
            );
            return Disposition::Error(libc::EPROTO);
        }

        let minor = init_in.minor.min(FUSE_KERNEL_MINOR_VERSION);
        let out = FuseInitOut {
            major: FUSE_KERNEL_VERSION,
            minor,
            max_readahead: init_in.max_readahead,
            flags: 0,
            max_background: 32,
            congestion_threshold: 32,
            max_write: 4096,
            time_gran: 1,
            reserved: [0; 9],
        };
        let payload = if init_in.minor <= 22 {
            &out.as_bytes()[..FUSE_COMPAT_22_INIT_OUT_SIZE]
        } else {
            out.as_bytes()
        };
        self.reply_payload(header.unique, payload)
    }

    fn handle_lookup(&mut self, header: &FuseInHeader, body: &[u8]) -> Disposition {
        if header.nodeid != FUSE_ROOT_ID {
            return Disposition::Error(libc::ENOENT);
        }
        let name = match body.iter().position(|&b| b == 0) {
            Some(nul) => &body[..nul],
            None => body,
        };
        let (nodeid, shutdown_after) = match name {
            b"package.zip" => (NODE_PACKAGE, false),
            b"exit" => (NODE_EXIT, true),
            _ => return Disposition::Error(libc::ENOENT),
        };

        let entry = FuseEntryOut {
            nodeid,
            generation: nodeid,
            entry_valid: ENTRY_VALID_SECS,
            attr_valid: ENTRY_VALID_SECS,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr: self.attr_for(nodeid),
        };
        let disposition = self.reply_payload(header.unique, entry.as_bytes());
        if shutdown_after {
            if !matches!(disposition, Disposition::Replied) {
                return disposition;
            }
            return Disposition::RepliedThenShutdown;
        }
        disposition
    }

    fn handle_getattr(&mut self, header: &FuseInHeader) -> Disposition {
        if !matches!(header.nodeid, FUSE_ROOT_ID | NODE_PACKAGE | NODE_EXIT) {
            return Disposition::Error(libc::ENOENT);
        }
        let out = FuseAttrOut {
            attr_valid: ENTRY_VALID_SECS,
            attr_valid_nsec: 0,
            dummy: 0,
            attr: self.attr_for(header.nodeid),
        };
        let disposition = self.reply_payload(header.unique, out.as_bytes());
        if header.nodeid == NODE_EXIT {
            if !matches!(disposition, Disposition::Replied) {
                return disposition;
            }
            return Disposition::RepliedThenShutdown;
        }
        disposition
    }

    fn handle_open(&mut self, header: &FuseInHeader) -> Disposition {
        match header.nodeid {
            NODE_PACKAGE => {
                let out = FuseOpenOut {
                    fh: PACKAGE_FH,
                    open_flags: 0,
                    padding: 0,
                };
                self.reply_payload(header.unique, out.as_bytes())
            }
            NODE_EXIT => Disposition::Error(libc::EPERM),
            _ => Disposition::Error(libc::ENOENT),
        }
    }

    fn handle_read(&mut self, header: &FuseInHeader, body: &[u8]) -> Disposition {
        if header.nodeid != NODE_PACKAGE {
            return Disposition::Error(libc::ENOENT);
        }
        let Ok(read_in) = FuseReadIn::ref_from_bytes(&body[..size_of::<FuseReadIn>().min(body.len())])
        else {
            return Disposition::Error(libc::EINVAL);
        };

        let size = read_in.size.min(self.block_size);
        let mut out = vec![0u8; size as usize];
        match self.cache.read(read_in.offset as u64, size, &mut out) {
            Ok(()) => self.reply_payload(header.unique, &out),
            Err(e) => {
                error!("block fetch failed: {e}");
                Disposition::Error(e.errno())
            }
        }
    }

    fn attr_for(&self, nodeid: u64) -> FuseAttr {
        let (size, mode, nlink) = match nodeid {
            FUSE_ROOT_ID => (4096u64, 0o40555u32, 1u32),
            NODE_PACKAGE => (self.cache.file_size(), 0o100444, 1),
            NODE_EXIT => (0, 0o100000, 1),
            _ => (0, 0, 1),
        };
        let blksize = 4096u32;
        let blocks = if size == 0 { 0 } else { (size - 1) / u64::from(blksize) + 1 };
        FuseAttr {
            ino: nodeid,
            size,
            blocks,
            mode,
            nlink,
            blksize,
            ..Default::default()
        }
    }

    fn reply_ok(&mut self, unique: u64) -> Disposition {
        self.reply_payload(unique, &[])
    }

    fn reply_payload(&mut self, unique: u64, payload: &[u8]) -> Disposition {
        let header = FuseOutHeader {
            len: (size_of::<FuseOutHeader>() + payload.len()) as u32,
            error: 0,
            unique,
        };
        let iov: SmallVec<[IoSlice<'_>; 2]> = if payload.is_empty() {
            smallvec![IoSlice::new(header.as_bytes())]
        } else {
            smallvec![IoSlice::new(header.as_bytes()), IoSlice::new(payload)]
        };
        match (&self.fuse_fd.0).write_vectored(&iov) {
            Ok(_) => Disposition::Replied,
            Err(e) => {
                error!("failed writing reply: {e}");
                Disposition::Error(libc::EIO)
            }
        }
    }

    fn reply_error(&mut self, unique: u64, errno: i32) -> io::Result<()> {
        let header = FuseOutHeader {
            len: size_of::<FuseOutHeader>() as u32,
            error: -errno,
            unique,
        };
        (&self.fuse_fd.0).write_all(header.as_bytes())
    }

    fn shutdown(&mut self) {
        debug!("shutting down fuse server at {}", self.mountpoint.display());
        self.cache.close();
        unmount_sideload(&self.mountpoint);
    }
}

impl<P> AsRawFd for FuseServer<P> {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.fuse_fd.as_raw_fd()
    }
}
