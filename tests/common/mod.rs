//! Shared test-client plumbing: a thin, deliberately separate protocol
//! client built directly on `nix`'s `sendmsg`/`recvmsg`, exercising the real
//! wire format end to end against a real `Server` bound to a throwaway
//! socket directory.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType, UnixAddr,
};

use filed::config::Config;
use filed::Server;

/// A running server bound inside a scratch directory that is removed when
/// the guard drops. The server's own thread is never explicitly stopped —
/// it dies with the test process, the same way a real daemon would be
/// reaped by `init` at machine shutdown.
pub struct TestServer {
    _dir: tempfile::TempDir,
    pub socket_path: std::path::PathBuf,
}

pub fn start(instance: u32, max_transfers: usize, open_fd_timeout_ms: u64) -> TestServer {
    // Writing to a destination the client already closed must surface as
    // `EPIPE`, not the default SIGPIPE disposition that would kill the test
    // process — the same setup the real binary does before serving.
    let _ = filed::config::block_sigpipe();

    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join(format!("filed.{instance}.socket"));

    let config = Config {
        server_name: "filed".to_string(),
        instance,
        socket_dir: dir.path().to_path_buf(),
        max_transfers,
        open_fd_timeout_ms,
        socket_uid: None,
        socket_gid: None,
    };
    let uid = nix::unistd::getuid().as_raw();
    let mut server = Server::new(config, uid).expect("server should bind");

    std::thread::spawn(move || {
        let _ = server.run();
    });

    TestServer {
        _dir: dir,
        socket_path,
    }
}

/// Sends one datagram carrying `payload` and up to two attached
/// descriptors to the server's listening socket. The kernel supplies
/// `SCM_CREDENTIALS` automatically on a `SO_PASSCRED` receiver even though
/// the sender attaches none explicitly.
pub fn send(socket_path: &std::path::Path, payload: &[u8], fds: &[BorrowedFd]) -> io::Result<()> {
    let client = socket::socket(AddressFamily::Unix, SockType::Datagram, SockFlag::empty(), None)
        .map_err(nix_to_io)?;
    let addr = UnixAddr::new(socket_path).map_err(nix_to_io)?;
    let iov = [io::IoSlice::new(payload)];

    let raw: Vec<_> = fds.iter().map(|f| f.as_raw_fd()).collect();
    if raw.is_empty() {
        socket::sendmsg::<UnixAddr>(client.as_raw_fd(), &iov, &[], MsgFlags::empty(), Some(&addr))
            .map_err(nix_to_io)?;
    } else {
        let cmsg = [ControlMessage::ScmRights(&raw)];
        socket::sendmsg::<UnixAddr>(client.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), Some(&addr))
            .map_err(nix_to_io)?;
    }
    Ok(())
}

/// A blocking pipe pair (read end, write end), matching the channel shape
/// `READ` requests use for their single status-and-data fd.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    nix::unistd::pipe().expect("pipe")
}

/// A connected `SOCK_STREAM` pair, the shape used for `SEND`'s status
/// channel and its distinct destination descriptor.
pub fn socketpair() -> (OwnedFd, OwnedFd) {
    socket::socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
        .expect("socketpair")
}

/// Reads exactly `want` bytes from `fd`, polling with `timeout` between
/// each read so a hung server fails the test instead of hanging it.
pub fn read_exact(fd: BorrowedFd<'_>, want: usize, timeout: Duration) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    let deadline = Instant::now() + timeout;

    while filled < want {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "read_exact timed out"))?;

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = remaining.as_millis().min(u16::MAX as u128) as u16;
        let n = poll(&mut fds, PollTimeout::from(millis)).map_err(nix_to_io)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read_exact timed out"));
        }

        match nix::unistd::read(fd, &mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {filled}/{want} bytes"),
                ))
            }
            Ok(n) => filled += n,
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(nix_to_io(e)),
        }
    }

    Ok(buf)
}

/// Reads until EOF (the peer closing its end), up to `timeout` total.
pub fn read_to_eof(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let deadline = Instant::now() + timeout;
    let mut scratch = [0u8; 65536];

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "read_to_eof timed out"))?;

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = remaining.as_millis().min(u16::MAX as u128) as u16;
        let n = poll(&mut fds, PollTimeout::from(millis)).map_err(nix_to_io)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read_to_eof timed out"));
        }

        match nix::unistd::read(fd, &mut scratch) {
            Ok(0) => return Ok(out),
            Ok(n) => out.extend_from_slice(&scratch[..n]),
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(nix_to_io(e)),
        }
    }
}

/// Asserts nothing arrives on `fd` within `timeout` — used to confirm a
/// cancelled/timed-out transfer's destination channel stays quiet.
pub fn assert_no_data(fd: BorrowedFd<'_>, timeout: Duration) {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    let n = poll(&mut fds, PollTimeout::from(millis)).expect("poll");
    assert_eq!(n, 0, "expected no data, but fd became readable");
}

fn nix_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
