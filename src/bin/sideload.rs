//! Manual test harness for the sideload core (C10).
//!
//! Mounts a package from a file, block-map, or ADB fd, prints the
//! negotiated path, and waits for a newline (or SIGINT) before tearing
//! the mount down. Driving the real installer is out of scope; this
//! binary exists to exercise the orchestrator end to end by hand.

use std::io::BufRead as _;
use std::os::unix::net::UnixStream;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;

use clap::Parser;
use fuse_sideload::{
    orchestrator, AdbProvider, BlockMapProvider, FileProvider, Ready, SideloadConfig,
    DEFAULT_BLOCK_SIZE, DEFAULT_MOUNTPOINT,
};

#[derive(Parser, Debug)]
#[command(about = "Mount an update package as a verified-block FUSE filesystem")]
struct Args {
    /// Directory to mount at. Must already exist.
    #[arg(long, default_value = DEFAULT_MOUNTPOINT)]
    mountpoint: PathBuf,

    /// Fuse block size in bytes.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Path to a regular file to serve as package.zip.
    #[arg(long, conflicts_with_all = ["block_map", "adb_fd"])]
    file: Option<PathBuf>,

    /// Path to a block-map file describing ranges on a block device.
    #[arg(long, conflicts_with_all = ["file", "adb_fd"])]
    block_map: Option<PathBuf>,

    /// An already-connected socket fd speaking the ADB block protocol,
    /// plus the negotiated file size (bytes).
    #[arg(long, requires = "adb_file_size")]
    adb_fd: Option<i32>,

    #[arg(long)]
    adb_file_size: Option<u64>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = if args.adb_fd.is_some() {
        SideloadConfig::adb(&args.mountpoint)
    } else {
        SideloadConfig::local(&args.mountpoint)
    };

    let session = if let Some(path) = &args.file {
        let provider = FileProvider::new(path, args.block_size).expect("open --file");
        orchestrator::run_sideload(provider, &config)
    } else if let Some(map) = &args.block_map {
        let provider = BlockMapProvider::new(map, args.block_size).expect("parse --block-map");
        orchestrator::run_sideload(provider, &config)
    } else if let Some(fd) = args.adb_fd {
        let socket = unsafe { UnixStream::from_raw_fd(fd) };
        let file_size = args.adb_file_size.expect("--adb-file-size required with --adb-fd");
        let provider = AdbProvider::new(socket, file_size, args.block_size);
        orchestrator::run_sideload(provider, &config)
    } else {
        eprintln!("one of --file, --block-map, or --adb-fd is required");
        std::process::exit(2);
    }
    .expect("fork sideload child");

    match session.wait_ready(&config) {
        Ready::Path(path) => println!("{}", path.display()),
        Ready::ChildExited => {
            eprintln!("sideload server exited before package.zip appeared");
            std::process::exit(1);
        }
        Ready::TimedOut => {
            eprintln!("timed out waiting for package.zip");
            session.finish();
            std::process::exit(1);
        }
    }

    let stdin = std::io::stdin();
    let _ = stdin.lock().lines().next();
    session.finish();
}
