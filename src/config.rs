//! Daemon configuration and the small pieces of process setup that do not
//! belong in the transfer engine itself.
//!
//! `Config` carries no parsing logic; building one from `argv` is the
//! binary's job (`src/bin/filed.rs`), the same separation `cberner-fuser`
//! draws between its library and the `clap`-based example binaries.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use log::warn;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, Pid};

/// Upper bound on the open-file timeout, matching the original daemon's
/// `OPEN_FD_TIMEOUT_MS_MAX` (one hour).
pub const OPEN_FD_TIMEOUT_MS_MAX: u64 = 3_600_000;

/// Runtime configuration for the transfer engine.
///
/// `root_dir` and the privilege-drop fields are accepted for compatibility
/// with the original's CLI surface but are not acted on here — chrooting
/// and dropping privileges are process-setup concerns this crate leaves to
/// its caller (see `DESIGN.md`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed prefix used to derive the socket path, e.g.
    /// `<sockdir>/<server_name>.<instance>.socket`.
    pub server_name: String,
    /// Caller-supplied instance identifier (the CLI's `-s`), letting more
    /// than one daemon of the same name run against distinct sockets.
    pub instance: u32,
    /// Directory the socket is created in.
    pub socket_dir: std::path::PathBuf,
    /// Maximum number of concurrent transfers (and open-file timers).
    pub max_transfers: usize,
    /// Milliseconds an opened-but-unsent file may sit idle before the
    /// server closes it and reports a timeout.
    pub open_fd_timeout_ms: u64,
    /// Owner uid/gid to `chown` the socket to, if different from the
    /// server process's own.
    pub socket_uid: Option<u32>,
    pub socket_gid: Option<u32>,
}

impl Config {
    /// Validates field ranges the constructor can't express in the type
    /// system (`open_fd_timeout_ms` in particular).
    pub fn validate(&self) -> io::Result<()> {
        if self.open_fd_timeout_ms == 0 || self.open_fd_timeout_ms > OPEN_FD_TIMEOUT_MS_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "open_fd_timeout_ms must be in 1..={OPEN_FD_TIMEOUT_MS_MAX}, got {}",
                    self.open_fd_timeout_ms
                ),
            ));
        }
        if self.max_transfers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_transfers must be > 0",
            ));
        }
        Ok(())
    }

    pub fn open_fd_timeout(&self) -> Duration {
        Duration::from_millis(self.open_fd_timeout_ms)
    }
}

/// Blocks `SIGPIPE` for the duration of the process.
///
/// Without this, writing to a destination fd the client has already closed
/// raises the process-terminating default disposition instead of surfacing
/// as `EPIPE` on the write call — the same reasoning the original daemon's
/// `main()` applies before it starts serving.
pub fn block_sigpipe() -> io::Result<()> {
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    }
    Ok(())
}

/// Writes a 4-byte status code to an inherited sync pipe and closes it,
/// letting a supervising parent process know whether the daemon finished
/// startup (binding the socket, entering the event loop) successfully.
///
/// `status` is `0` on success, an errno otherwise — the same convention
/// `main.c`'s `sync_parent` uses.
pub fn notify_parent(fd: i32, status: i32) {
    if fd < 0 {
        return;
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let bytes = status.to_ne_bytes();
    if let Err(e) = unistd::write(&owned, &bytes) {
        warn!("failed to notify parent on sync fd: {e}");
    }
    // `owned` drops here, closing the fd.
}

/// Returns `true` if the current process is running as root.
///
/// `src/bin/filed.rs` logs a warning rather than refusing to start, since
/// the chroot/privilege-drop path this would normally gate is out of scope
/// here (see `DESIGN.md`).
pub fn running_as_root() -> bool {
    unistd::geteuid().is_root()
}

/// The current process's pid, used for log messages only.
pub fn pid() -> Pid {
    unistd::getpid()
}
