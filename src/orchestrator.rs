//! Fork/poll/shutdown protocol that drives one sideload session (§4.7, C7).
//!
//! The parent process forks a child that runs the [`FuseServer`], polls for
//! `package.zip` to appear, hands the path back to the caller, and on
//! completion triggers the exit sentinel and reaps the child.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};

use crate::provider::DataProvider;
use crate::server::FuseServer;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_MOUNTPOINT};

/// Parameters for one sideload session.
#[derive(Debug, Clone)]
pub struct SideloadConfig {
    /// Directory to mount the filesystem at. Must already exist.
    pub mountpoint: PathBuf,
    /// How long to poll for `package.zip` to appear before giving up.
    pub poll_deadline: Duration,
}

impl SideloadConfig {
    /// Config for a local source (file or block-map): a 10 second deadline.
    pub fn local(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            poll_deadline: Duration::from_secs(10),
        }
    }

    /// Config for an ADB source: a 300 second deadline, since the host may
    /// still be negotiating the transfer.
    pub fn adb(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            poll_deadline: Duration::from_secs(300),
        }
    }
}

impl Default for SideloadConfig {
    fn default() -> Self {
        Self::local(DEFAULT_MOUNTPOINT)
    }
}

/// Outcome of waiting for the package to become available.
pub enum Ready {
    /// `package.zip` appeared; callers should pass this path to the
    /// installer, then call [`Session::finish`].
    Path(PathBuf),
    /// The child exited before the package appeared (mount failure,
    /// provider failure on the first fetch, etc).
    ChildExited,
    /// `poll_deadline` elapsed with no sign of the package.
    TimedOut,
}

/// A running sideload session: the forked child and its mountpoint.
#[derive(Debug)]
pub struct Session {
    child: nix::unistd::Pid,
    mountpoint: PathBuf,
}

impl Session {
    /// Waits for `<mountpoint>/package.zip` to appear, up to
    /// `config.poll_deadline`, checking once a second.
    pub fn wait_ready(&self, config: &SideloadConfig) -> Ready {
        let package_path = self.mountpoint.join("package.zip");
        let deadline = Instant::now() + config.poll_deadline;

        loop {
            if std::fs::metadata(&package_path).is_ok() {
                return Ready::Path(package_path);
            }
            match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(_) => return Ready::ChildExited,
                Err(e) => {
                    warn!("waitpid poll failed: {e}");
                    return Ready::ChildExited;
                }
            }
            if Instant::now() >= deadline {
                return Ready::TimedOut;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    /// Triggers shutdown by stat-ing the `exit` node, then reaps the child.
    ///
    /// Safe to call after [`Ready::ChildExited`]/[`Ready::TimedOut`] too:
    /// the `stat` simply fails (`ENOENT`/`ENOTCONN`) and `waitpid` reaps
    /// whatever is left.
    pub fn finish(self) {
        let exit_path = self.mountpoint.join("exit");
        let _ = std::fs::metadata(&exit_path);
        match waitpid(self.child, None) {
            Ok(status) => debug!("sideload child exited: {status:?}"),
            Err(e) => warn!("waitpid reap failed: {e}"),
        }
    }
}

/// Forks a child that mounts and runs a [`FuseServer`] over `provider` at
/// `config.mountpoint`, returning a [`Session`] handle to the parent.
///
/// The child never returns: it runs the server loop to completion and
/// then calls `std::process::exit`.
pub fn run_sideload<P: DataProvider>(provider: P, config: &SideloadConfig) -> nix::Result<Session> {
    let mountpoint = config.mountpoint.clone();

    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(Session { child, mountpoint }),
        ForkResult::Child => {
            let exit_code = match FuseServer::mount(&mountpoint, provider) {
                Ok(mut server) => {
                    server.run();
                    0
                }
                Err(e) => {
                    warn!("failed to mount sideload fs: {e}");
                    1
                }
            };
            std::process::exit(exit_code);
        }
    }
}

/// `DEFAULT_BLOCK_SIZE`, re-exported here for callers constructing a
/// provider before building a [`SideloadConfig`].
pub const BLOCK_SIZE: u32 = DEFAULT_BLOCK_SIZE;
