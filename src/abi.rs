//! Fixed-layout FUSE kernel wire structs.
//!
//! Only the subset needed by this server (INIT, LOOKUP, GETATTR, OPEN,
//! READ, FLUSH, RELEASE) is defined here, laid out to match
//! `linux/fuse.h` exactly. We do not link against libfuse or
//! `<linux/fuse.h>`; the field order below is the contract.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub(crate) const FUSE_ROOT_ID: u64 = 1;
pub(crate) const FUSE_KERNEL_VERSION: u32 = 7;
pub(crate) const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

/// Size of `fuse_init_out` as understood by kernels at or before minor 22,
/// i.e. before `max_write` grew trailing fields. Matches
/// `FUSE_COMPAT_22_INIT_OUT_SIZE` in `linux/fuse.h`.
pub(crate) const FUSE_COMPAT_22_INIT_OUT_SIZE: usize = 24;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types, dead_code)]
pub(crate) enum Opcode {
    FuseLookup = 1,
    FuseForget = 2,
    FuseGetattr = 3,
    FuseOpen = 14,
    FuseRead = 15,
    FuseRelease = 18,
    FuseFlush = 25,
    FuseInit = 26,
    FuseDestroy = 38,
}

impl TryFrom<u32> for Opcode {
    type Error = ();

    fn try_from(n: u32) -> Result<Self, ()> {
        match n {
            1 => Ok(Self::FuseLookup),
            2 => Ok(Self::FuseForget),
            3 => Ok(Self::FuseGetattr),
            14 => Ok(Self::FuseOpen),
            15 => Ok(Self::FuseRead),
            18 => Ok(Self::FuseRelease),
            25 => Ok(Self::FuseFlush),
            26 => Ok(Self::FuseInit),
            38 => Ok(Self::FuseDestroy),
            _ => Err(()),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub(crate) struct FuseInHeader {
    pub(crate) len: u32,
    pub(crate) opcode: u32,
    pub(crate) unique: u64,
    pub(crate) nodeid: u64,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) pid: u32,
    pub(crate) padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct FuseOutHeader {
    pub(crate) len: u32,
    pub(crate) error: i32,
    pub(crate) unique: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub(crate) struct FuseInitIn {
    pub(crate) major: u32,
    pub(crate) minor: u32,
    pub(crate) max_readahead: u32,
    pub(crate) flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct FuseInitOut {
    pub(crate) major: u32,
    pub(crate) minor: u32,
    pub(crate) max_readahead: u32,
    pub(crate) flags: u32,
    pub(crate) max_background: u16,
    pub(crate) congestion_threshold: u16,
    pub(crate) max_write: u32,
    pub(crate) time_gran: u32,
    pub(crate) reserved: [u32; 9],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct FuseAttr {
    pub(crate) ino: u64,
    pub(crate) size: u64,
    pub(crate) blocks: u64,
    pub(crate) atime: i64,
    pub(crate) mtime: i64,
    pub(crate) ctime: i64,
    pub(crate) atimensec: u32,
    pub(crate) mtimensec: u32,
    pub(crate) ctimensec: u32,
    pub(crate) mode: u32,
    pub(crate) nlink: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) rdev: u32,
    pub(crate) blksize: u32,
    pub(crate) padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct FuseEntryOut {
    pub(crate) nodeid: u64,
    pub(crate) generation: u64,
    pub(crate) entry_valid: u64,
    pub(crate) attr_valid: u64,
    pub(crate) entry_valid_nsec: u32,
    pub(crate) attr_valid_nsec: u32,
    pub(crate) attr: FuseAttr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct FuseAttrOut {
    pub(crate) attr_valid: u64,
    pub(crate) attr_valid_nsec: u32,
    pub(crate) dummy: u32,
    pub(crate) attr: FuseAttr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct FuseOpenOut {
    pub(crate) fh: u64,
    pub(crate) open_flags: u32,
    pub(crate) padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub(crate) struct FuseReadIn {
    pub(crate) fh: u64,
    pub(crate) offset: i64,
    pub(crate) size: u32,
    pub(crate) read_flags: u32,
    pub(crate) lock_owner: u64,
    pub(crate) flags: i32,
    pub(crate) padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub(crate) struct FuseFlushIn {
    pub(crate) fh: u64,
    pub(crate) unused: u32,
    pub(crate) padding: u32,
    pub(crate) lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub(crate) struct FuseReleaseIn {
    pub(crate) fh: u64,
    pub(crate) flags: i32,
    pub(crate) release_flags: u32,
    pub(crate) lock_owner: u64,
}
