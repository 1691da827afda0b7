//! Request handling (§4.6.1): everything that happens when the request
//! socket becomes readable, through to `FILE_INFO`/error replies.
//!
//! Grounded on `server.c`'s `handle_reqfd`/`process_request`/`add_xfer`/
//! `add_open_file`/`get_open_file`; `server_responses.c`'s `send_req_err`
//! (used before a transfer's first acknowledgement has gone out — `FILE_INFO`
//! command code) vs. `send_xfer_err` (used once a transfer is already live —
//! `XFER_STAT` command code) fixes which error cmd byte each path below uses.

use std::ffi::CStr;
use std::os::fd::{AsFd, OwnedFd};

use log::warn;
use smallvec::SmallVec;

use crate::error;
use crate::fileio;
use crate::poller::{ResourceKind, Token};
use crate::protocol::request::{self, FileRequestKind, Request};
use crate::protocol::response::{self, FileInfo};
use crate::transport::{Datagram, PeerListener, MAX_FDS};

use super::resources::{Cmd, Destination, Timer, Transfer};
use super::Server;

impl Server {
    /// Drains the request socket until `recv` would block. Returns `false`
    /// if the last error observed was fatal (mirrors `handle_reqfd`'s
    /// `!errno_is_fatal(errno)` gate, which ends the event loop).
    pub(super) fn handle_request_socket(&mut self) -> bool {
        loop {
            match self.listener.recv(self.recv_buf_size) {
                Ok(Some(dgram)) => self.dispatch_datagram(dgram),
                Ok(None) => return true,
                Err(e) => return !error::is_fatal(&e),
            }
        }
    }

    fn dispatch_datagram(&mut self, dgram: Datagram) {
        let Datagram {
            bytes,
            mut fds,
            creds,
        } = dgram;

        let cmd_byte = bytes.first().copied().unwrap_or(0);
        let is_cancel = cmd_byte == request::cmd::CANCEL;

        if !is_cancel && !(1..=2).contains(&fds.len()) {
            warn!(
                "received unexpected number of file descriptors ({}) from client; ignoring request",
                fds.len()
            );
            return;
        }

        if creds.uid != self.uid {
            warn!("invalid uid: expected {}, got {}", self.uid, creds.uid);
            if let Some(first) = fds.first() {
                let _ = PeerListener::send_to_fd(
                    first.as_fd(),
                    &response::error_response(response::cmd::FILE_INFO, libc::EACCES as u8),
                );
            }
            return;
        }

        let req = match Request::decode(&bytes) {
            Ok(req) => req,
            Err(e) => {
                log::info!("received malformed request: {e}");
                if let Some(first) = fds.first() {
                    let _ = PeerListener::send_to_fd(
                        first.as_fd(),
                        &response::error_response(
                            response::cmd::FILE_INFO,
                            libc::EINVAL as u8,
                        ),
                    );
                }
                return;
            }
        };

        match req {
            Request::File {
                kind: FileRequestKind::FileOpen,
                offset,
                len,
                filename,
            } => {
                let Some(status_fd) = pop_front(&mut fds) else {
                    return;
                };
                self.handle_file_open(offset, len, &filename, creds.pid, status_fd);
            }
            Request::File {
                kind: FileRequestKind::Read,
                offset,
                len,
                filename,
            } => {
                let Some(status_fd) = pop_front(&mut fds) else {
                    return;
                };
                self.handle_read_or_send(
                    Cmd::Read,
                    offset,
                    len,
                    &filename,
                    creds.pid,
                    status_fd,
                    Destination::SameAsStatus,
                );
            }
            Request::File {
                kind: FileRequestKind::Send,
                offset,
                len,
                filename,
            } => {
                let Some(status_fd) = pop_front(&mut fds) else {
                    return;
                };
                let Some(dest_fd) = pop_front(&mut fds) else {
                    warn!("SEND request missing destination descriptor; ignoring");
                    return;
                };
                self.handle_read_or_send(
                    Cmd::Send,
                    offset,
                    len,
                    &filename,
                    creds.pid,
                    status_fd,
                    Destination::Fd(dest_fd),
                );
            }
            Request::SendOpen { txnid } => {
                let Some(dest_fd) = pop_front(&mut fds) else {
                    return;
                };
                self.handle_send_open(txnid, creds.pid, dest_fd);
            }
            Request::Cancel { txnid } => {
                self.handle_cancel(txnid, creds.pid);
            }
        }
    }

    /// `FILE_OPEN`: opens the file, arms its one-shot timer, acknowledges
    /// with `FILE_INFO`. Destination stays unregistered until `SEND_OPEN`.
    fn handle_file_open(
        &mut self,
        offset: i64,
        len: u64,
        filename: &CStr,
        client_pid: Option<u32>,
        status_fd: OwnedFd,
    ) {
        match self.create_transfer(Cmd::Opened, offset, len, filename, client_pid, status_fd, Destination::None) {
            Ok((txnid, info)) => {
                if let Err(e) = self.arm_open_timer(txnid) {
                    warn!("failed to arm open-file timer for txnid {txnid}: {e}");
                    if let Some(xfer) = self.xfers.remove(txnid) {
                        let _ = PeerListener::send_to_fd(
                            xfer.status_fd.as_fd(),
                            &response::error_response(response::cmd::FILE_INFO, error::to_status_byte(&e)),
                        );
                    }
                    return;
                }
                if let Some(xfer) = self.xfers.find(txnid) {
                    let _ = PeerListener::send_to_fd(xfer.status_fd.as_fd(), &info.encode());
                }
            }
            Err((status_fd, e)) => {
                let _ = PeerListener::send_to_fd(
                    status_fd.as_fd(),
                    &response::error_response(response::cmd::FILE_INFO, error::to_status_byte(&e)),
                );
            }
        }
    }

    /// `READ`/`SEND`: opens the file, registers the destination for
    /// writability, acknowledges with `FILE_INFO`.
    fn handle_read_or_send(
        &mut self,
        cmd: Cmd,
        offset: i64,
        len: u64,
        filename: &CStr,
        client_pid: Option<u32>,
        status_fd: OwnedFd,
        dest: Destination,
    ) {
        match self.create_transfer(cmd, offset, len, filename, client_pid, status_fd, dest) {
            Ok((txnid, info)) => {
                let reg = {
                    let xfer = self.xfers.find(txnid).expect("transfer just inserted");
                    self.poller
                        .register_write(xfer.dest_fd(), Token::new(ResourceKind::Transfer, txnid))
                };

                if let Err(e) = reg {
                    warn!("failed to register destination descriptor for txnid {txnid}: {e}");
                    if let Some(xfer) = self.xfers.remove(txnid) {
                        let _ = PeerListener::send_to_fd(
                            xfer.status_fd.as_fd(),
                            &response::error_response(response::cmd::FILE_INFO, error::to_status_byte(&e)),
                        );
                    }
                    return;
                }

                if let Some(xfer) = self.xfers.find(txnid) {
                    let _ = PeerListener::send_to_fd(xfer.status_fd.as_fd(), &info.encode());
                }
            }
            Err((status_fd, e)) => {
                let _ = PeerListener::send_to_fd(
                    status_fd.as_fd(),
                    &response::error_response(response::cmd::FILE_INFO, error::to_status_byte(&e)),
                );
            }
        }
    }

    /// `SEND_OPEN`: promotes an `OPENED` transfer to `SEND`, registers its
    /// new destination. No ack is sent — the client already has `FILE_INFO`.
    fn handle_send_open(&mut self, txnid: u64, client_pid: Option<u32>, dest_fd: OwnedFd) {
        if !self.check_owner(txnid, client_pid) {
            return; // dest_fd drops here, closing it
        }

        let Some(xfer) = self.xfers.find_mut(txnid) else {
            return;
        };
        if xfer.defer == super::resources::Deferral::Cancel {
            return; // dest_fd drops here, closing it
        }

        xfer.cmd = Cmd::Send;
        xfer.dest = Destination::Fd(dest_fd);

        let reg = {
            let xfer = self.xfers.find(txnid).expect("checked above");
            self.poller
                .register_write(xfer.dest_fd(), Token::new(ResourceKind::Transfer, txnid))
        };

        if let Err(e) = reg {
            if let Some(xfer) = self.xfers.find(txnid) {
                let _ = PeerListener::send_to_fd(
                    xfer.status_fd.as_fd(),
                    &response::error_response(response::cmd::XFER_STAT, error::to_status_byte(&e)),
                );
            }
            self.xfers.remove(txnid);
        }
    }

    /// `CANCEL`: defers teardown to the secondary pass so an in-flight
    /// `transfer_file` burst is never interrupted mid-call.
    fn handle_cancel(&mut self, txnid: u64, client_pid: Option<u32>) {
        if !self.check_owner(txnid, client_pid) {
            return;
        }
        self.defer_xfer(txnid, super::resources::Deferral::Cancel);
    }

    /// Validates that `txnid` exists and, when both sides know a pid,
    /// that it matches the transfer's owner. On platforms/backends where
    /// a pid is unavailable this degrades to a no-op per spec.md §9(iii).
    fn check_owner(&self, txnid: u64, client_pid: Option<u32>) -> bool {
        let Some(xfer) = self.xfers.find(txnid) else {
            // Timer probably expired already; no status channel survives to
            // report anything on.
            return false;
        };
        if let (Some(owner), Some(caller)) = (xfer.client_pid, client_pid) {
            if owner != caller {
                warn!(
                    "client pid {caller} tried to access transaction owned by pid {owner} (txnid {txnid})"
                );
                return false;
            }
        }
        true
    }

    /// Shared `READ`/`SEND`/`FILE_OPEN` validation and creation: checks
    /// table capacity, opens the file, validates offset/len against the
    /// on-disk size, assigns a txnid, and inserts into the transfer table.
    ///
    /// On failure, returns the status fd back to the caller (still open)
    /// so it can report the error, matching `add_xfer`'s postcondition that
    /// descriptor ownership is untouched by a failed call.
    fn create_transfer(
        &mut self,
        cmd: Cmd,
        offset: i64,
        len: u64,
        filename: &CStr,
        client_pid: Option<u32>,
        status_fd: OwnedFd,
        dest: Destination,
    ) -> Result<(u64, FileInfo), (OwnedFd, std::io::Error)> {
        if self.xfers.is_full() {
            warn!(
                "transfer table is full ({}/{} items)",
                self.xfers.len(),
                self.xfers.capacity()
            );
            return Err((status_fd, std::io::Error::from_raw_os_error(libc::EMFILE)));
        }

        let (file, stat) = match fileio::open_for_read(filename, offset, len) {
            Ok(v) => v,
            Err(e) => return Err((status_fd, e)),
        };

        if stat.size == 0 {
            return Err((status_fd, std::io::Error::from_raw_os_error(libc::EINVAL)));
        }

        if (offset as u64).wrapping_add(len) > stat.size {
            return Err((status_fd, std::io::Error::from_raw_os_error(libc::ERANGE)));
        }

        let xfer_nbytes = if len > 0 { len } else { stat.size - offset as u64 };

        let txnid = self.next_txnid();
        let generation = self.next_generation();

        let transfer = Transfer {
            txnid,
            generation,
            cmd,
            file,
            file_size: xfer_nbytes,
            blksize: stat.blksize,
            bytes_remaining: xfer_nbytes,
            status_fd,
            dest,
            client_pid,
            defer: super::resources::Deferral::None,
        };

        let info = FileInfo {
            size: xfer_nbytes,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            txnid,
        };

        if let Err(transfer) = self.xfers.insert(transfer) {
            warn!("couldn't insert transfer into table (slot for txnid {txnid} probably taken)");
            let Transfer { status_fd, .. } = transfer;
            return Err((status_fd, std::io::Error::from_raw_os_error(libc::EMFILE)));
        }

        Ok((txnid, info))
    }

    /// Arms a one-shot `open_fd_timeout_ms` timer for a just-created
    /// `OPENED` transfer and inserts it into the timer table.
    fn arm_open_timer(&mut self, txnid: u64) -> std::io::Result<()> {
        let generation = self
            .xfers
            .find(txnid)
            .map(|x| x.generation)
            .expect("transfer just inserted");

        let token = Token::new(ResourceKind::Timer, txnid);
        let handle = self.poller.add_timer(self.config.open_fd_timeout_ms, token)?;
        let timer = Timer {
            txnid,
            generation,
            handle,
        };

        if let Err(timer) = self.timers.insert(timer) {
            let _ = self.poller.deregister(timer.handle.as_fd());
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "timer table slot collision",
            ));
        }

        Ok(())
    }
}

fn pop_front(fds: &mut SmallVec<[OwnedFd; MAX_FDS]>) -> Option<OwnedFd> {
    if fds.is_empty() {
        None
    } else {
        Some(fds.remove(0))
    }
}
