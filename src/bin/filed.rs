//! CLI entry point: parses `argv`, wires a `filed::Config`, and runs the
//! transfer engine until termination.
//!
//! Grounded on spec.md §6's flag surface; the `clap`-derive pattern itself
//! follows the teacher crate's example binaries (`examples/common/args.rs`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use filed::config::{self, Config};

/// Local file I/O delegation daemon: streams file contents to clients via
/// zero-copy transfer over a datagram UNIX socket.
#[derive(Debug, Parser)]
#[command(name = "filed", version)]
struct CliArgs {
    /// Caller-supplied instance identifier; the socket is bound at
    /// `<sockdir>/filed.<instance>.socket`.
    #[arg(short = 's', long = "instance")]
    instance: u32,

    /// Root directory the daemon serves files from.
    ///
    /// Accepted for parity with the original CLI surface; this build does
    /// not chroot into it (see DESIGN.md).
    #[arg(short = 'r', long = "root-dir")]
    root_dir: PathBuf,

    /// Maximum number of concurrent transfers.
    #[arg(short = 'n', long = "maxfiles")]
    maxfiles: usize,

    /// Milliseconds an opened-but-unsent file may sit idle before timeout.
    #[arg(short = 't', long = "open-fd-timeout-ms")]
    open_fd_timeout_ms: u64,

    /// Directory the listening socket is created in.
    #[arg(short = 'S', long = "sockdir", default_value = "/var/run/filed")]
    sockdir: PathBuf,

    /// User to run as.
    ///
    /// Accepted for parity with the original CLI surface; privilege drop is
    /// not performed by this build (see DESIGN.md).
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Group to run as (see `user` above).
    #[arg(short = 'g', long = "group")]
    group: Option<String>,

    /// Daemonize after startup.
    #[arg(short = 'd', long = "daemonize")]
    daemonize: bool,

    /// Synchronize with a supervising parent over an inherited pipe slot
    /// (fd `PROC_SYNCFD`) once the socket is bound.
    #[arg(short = 'p', long = "sync-parent")]
    sync_parent: bool,
}

/// The fd slot a supervising parent is expected to have dup'd its sync pipe
/// onto, matching the original daemon's `PROC_SYNCFD` convention.
const PROC_SYNCFD: i32 = 3;

fn main() -> ExitCode {
    env_logger::init();

    let args = CliArgs::parse();

    if args.daemonize {
        warn!("-d/--daemonize was requested but this build does not fork; run it under a supervisor instead");
    }
    if args.user.is_some() || args.group.is_some() {
        warn!("-u/-g were given but this build does not drop privileges (see DESIGN.md)");
    }

    let config = Config {
        server_name: "filed".to_string(),
        instance: args.instance,
        socket_dir: args.sockdir,
        max_transfers: args.maxfiles,
        open_fd_timeout_ms: args.open_fd_timeout_ms,
        socket_uid: None,
        socket_gid: None,
    };

    if let Err(e) = config::block_sigpipe() {
        error!("failed to block SIGPIPE: {e}");
        notify_parent_if_requested(args.sync_parent, e.raw_os_error().unwrap_or(libc::EIO));
        return ExitCode::FAILURE;
    }

    if config::running_as_root() {
        warn!("running as root; this build does not drop privileges (see DESIGN.md)");
    }

    let _ = &args.root_dir; // accepted for CLI parity; chroot is out of scope here

    let uid = nix::unistd::getuid().as_raw();

    let mut server = match filed::Server::new(config, uid) {
        Ok(server) => {
            notify_parent_if_requested(args.sync_parent, 0);
            server
        }
        Err(e) => {
            error!("failed to start: {e}");
            notify_parent_if_requested(args.sync_parent, e.raw_os_error().unwrap_or(libc::EIO));
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("event loop exited with error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn notify_parent_if_requested(sync_parent: bool, status: i32) {
    if sync_parent {
        config::notify_parent(PROC_SYNCFD, status);
    }
}
