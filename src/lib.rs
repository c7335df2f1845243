//! Verified-block FUSE filesystem for sideloading update packages from an
//! untrusted remote source.
//!
//! This crate exposes a two-node, read-only filesystem — `package.zip` and
//! `exit` — backed by a block-granular cache that pins the SHA-256 of
//! every block on first fetch and rejects any later fetch that disagrees.
//! That closes the gap between "verify the package" and "install the
//! package" when the bytes come from a source that cannot be trusted to
//! hand back the same data twice, such as an ADB host or a block device
//! on removable storage. No libfuse: requests are read off `/dev/fuse`
//! and dispatched by hand.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod abi;
mod cache;
mod channel;
pub mod error;
pub mod orchestrator;
pub mod provider;
mod server;

pub use cache::BlockCache;
pub use error::{CacheError, ConfigError};
pub use orchestrator::{run_sideload, Ready, Session, SideloadConfig};
pub use provider::{AdbProvider, BlockMapProvider, DataProvider, FileProvider, RangeSet};
pub use server::FuseServer;

/// Conventional block size used by the orchestrator (§6): 64 KiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 65536;

/// Conventional mountpoint used by the orchestrator (§6).
pub const DEFAULT_MOUNTPOINT: &str = "/sideload";
