//! Peer transport (C4): the datagram UNIX socket that carries request
//! bytes, up to `MAX_FDS` attached descriptors, and the sender's peer
//! credentials.
//!
//! Grounded on the `us_recv`/`us_set_passcred_option` contract in
//! `unix_socket_server.h`; the actual `sendmsg`/`recvmsg` plumbing follows
//! the ancillary-data construction `nagisa-sendfd` uses for exactly this
//! fd-passing pattern, built on top of `nix`'s safe wrappers instead of
//! raw `libc::cmsghdr` manipulation.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    self, AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use smallvec::SmallVec;

/// Maximum number of file descriptors carried in a single datagram: the
/// status channel, plus (for `SEND`) a distinct destination descriptor.
pub const MAX_FDS: usize = 2;

/// Peer credentials recovered from `SCM_CREDENTIALS` ancillary data.
///
/// `pid` is `None` on platforms whose recommended credential-passing
/// mechanism does not carry it (the original's FreeBSD backend leaves this
/// as a sentinel `US_INVALID_PID`); the Linux backend here always
/// populates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<u32>,
}

/// A received datagram: payload bytes, attached descriptors, sender
/// credentials.
#[derive(Debug)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    /// Almost always 0-2 descriptors (status, optionally a distinct
    /// destination); `SmallVec` keeps the common case off the heap the way
    /// the original sizes its fd array at `maxfds`.
    pub fds: SmallVec<[OwnedFd; MAX_FDS]>,
    pub creds: PeerCredentials,
}

/// The server's listening endpoint.
pub struct PeerListener {
    socket: OwnedFd,
    path: PathBuf,
}

impl PeerListener {
    /// Binds a `SOCK_DGRAM` UNIX socket at
    /// `<socket_dir>/<name>.<instance>.socket`, mode `0o700`, with
    /// `SO_PASSCRED` enabled so every `recv` carries the sender's
    /// credentials.
    pub fn bind(socket_dir: &Path, name: &str, instance: u32) -> io::Result<PeerListener> {
        let path = socket_dir.join(format!("{name}.{instance}.socket"));
        let _ = std::fs::remove_file(&path);

        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(nix_to_io)?;

        let addr = UnixAddr::new(&path).map_err(nix_to_io)?;
        socket::bind(fd.as_raw_fd(), &addr).map_err(nix_to_io)?;

        socket::setsockopt(&fd, socket::sockopt::PassCred, &true).map_err(nix_to_io)?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;

        Ok(PeerListener { socket: fd, path })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Receives one datagram. Returns `Ok(None)` on `EWOULDBLOCK`/`EAGAIN`
    /// — the drained-queue signal the request-socket readiness handler
    /// loops on.
    pub fn recv(&self, buf_size: usize) -> io::Result<Option<Datagram>> {
        let mut bytes = vec![0u8; buf_size];
        let mut iov = [std::io::IoSliceMut::new(&mut bytes)];

        let fd_space = nix::cmsg_space!([RawFd; MAX_FDS]);
        let cred_space = nix::cmsg_space!(libc::ucred);
        let mut cmsg_buf = Vec::with_capacity(fd_space.len() + cred_space.len());
        cmsg_buf.extend_from_slice(&fd_space);
        cmsg_buf.extend_from_slice(&cred_space);

        let msg = match socket::recvmsg::<()>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        ) {
            Ok(m) => m,
            Err(nix::errno::Errno::EWOULDBLOCK) => return Ok(None),
            Err(e) => return Err(nix_to_io(e)),
        };

        if msg.flags.intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC) {
            // Mirrors `us_recv`: truncation of either the payload or the
            // ancillary data is reported as `ERANGE`, a fatal protocol error.
            return Err(io::Error::from_raw_os_error(libc::ERANGE));
        }

        let nread = msg.bytes;
        let mut fds = SmallVec::new();
        let mut creds = None;

        for cmsg in msg.cmsgs().map_err(nix_to_io)? {
            match cmsg {
                ControlMessageOwned::ScmRights(raw_fds) => {
                    fds.extend(raw_fds.into_iter().map(|f| unsafe { OwnedFd::from_raw_fd(f) }));
                }
                ControlMessageOwned::ScmCredentials(ucred) => {
                    creds = Some(PeerCredentials {
                        uid: ucred.uid(),
                        gid: ucred.gid(),
                        pid: Some(ucred.pid() as u32),
                    });
                }
                _ => {}
            }
        }

        bytes.truncate(nread);

        let creds = creds.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram carried no SCM_CREDENTIALS (is SO_PASSCRED set?)",
            )
        })?;

        Ok(Some(Datagram { bytes, fds, creds }))
    }

    /// Sends `payload` with no attached descriptors — used for error
    /// responses and retried terminal notifications.
    pub fn send_to_fd(fd: BorrowedFd<'_>, payload: &[u8]) -> io::Result<usize> {
        nix::unistd::write(fd, payload).map_err(nix_to_io)
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn nix_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
