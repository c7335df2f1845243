//! Raw communication channel to the FUSE kernel driver (C6).
//!
//! No libfuse: `/dev/fuse` is opened directly and `mount(2)` is invoked by
//! hand, the same way the rest of this crate talks to the kernel without
//! indirection.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::{debug, error};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{getgid, getuid};

/// Owns the open `/dev/fuse` file descriptor for one mount.
#[derive(Debug)]
pub(crate) struct DevFuse(pub(crate) File);

impl AsRawFd for DevFuse {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0.as_raw_fd()
    }
}

impl DevFuse {
    const PATH: &'static str = "/dev/fuse";

    fn open() -> io::Result<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::PATH)
            .map(Self)
    }
}

/// Opens `/dev/fuse` and mounts it at `mountpoint`, capping every kernel
/// read request at `max_read` bytes (one block) per §4.6.
///
/// Best-effort unmounts whatever is already at `mountpoint` first, in
/// case a previous run exited without tearing down cleanly.
pub(crate) fn mount_sideload(mountpoint: &Path, max_read: u32) -> io::Result<DevFuse> {
    let _ = umount2(mountpoint, MntFlags::MNT_FORCE);

    let fuse_fd = DevFuse::open().inspect_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            error!("{} not found, is the fuse module loaded?", DevFuse::PATH);
        }
    })?;

    let opts = format!(
        "fd={},user_id={},group_id={},max_read={},allow_other,rootmode=040000",
        fuse_fd.as_raw_fd(),
        getuid(),
        getgid(),
        max_read,
    );
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC;

    mount(
        Some("/dev/fuse"),
        mountpoint,
        Some("fuse"),
        flags,
        Some(opts.as_str()),
    )
    .map_err(|errno| io::Error::other(format!("mount({}) failed: {errno}", mountpoint.display())))?;

    debug!("mounted sideload fs at {} ({opts})", mountpoint.display());
    Ok(fuse_fd)
}

/// Best-effort lazy unmount at shutdown. Errors are logged, not
/// propagated: by this point the server is exiting regardless.
pub(crate) fn unmount_sideload(mountpoint: &Path) {
    if let Err(errno) = umount2(mountpoint, MntFlags::MNT_DETACH) {
        error!("unmount of {} failed: {errno}", mountpoint.display());
    }
}
