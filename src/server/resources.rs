//! Resource types the transfer engine owns: live transfers, open-file
//! timers, and buffered terminal responses.
//!
//! Grounded on `server_resources.h`/`.c`. The original type-puns these
//! three structs through a shared leading `tag` field so the poller can
//! hand back a `void*` and have the core figure out what it points to;
//! here that dispatch happens through `poller::Token::kind` instead (see
//! `poller.rs`'s module doc), so these types carry no tag of their own.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::fileio::FileStat;
use crate::poller::TimerHandle;
use crate::protocol::FileRequestKind;
use crate::xfer_table::HasTxnId;

/// What stage of its lifecycle a transfer is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Read,
    Send,
    /// Opened via `FILE_OPEN`, awaiting `SEND_OPEN` promotion or timeout.
    Opened,
}

impl From<FileRequestKind> for Cmd {
    fn from(k: FileRequestKind) -> Cmd {
        match k {
            FileRequestKind::Read => Cmd::Read,
            FileRequestKind::Send => Cmd::Send,
            FileRequestKind::FileOpen => Cmd::Opened,
        }
    }
}

/// Whether, and why, a transfer is queued for the secondary pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    None,
    /// To be torn down during the secondary pass.
    Cancel,
    /// Saturated its per-call I/O budget during the primary pass; revisit
    /// during the secondary pass until its destination can take more.
    Ready,
}

/// The destination side of a transfer.
pub enum Destination {
    /// `READ`: the status fd doubles as the pipe destination.
    SameAsStatus,
    /// `SEND`: a distinct destination fd, usually a socket.
    Fd(OwnedFd),
    /// `FILE_OPEN`, not yet promoted.
    None,
}

/// A live (or pending-open) file transfer.
pub struct Transfer {
    pub txnid: u64,
    /// Distinct from `txnid`; stamped on creation and echoed by this
    /// transfer's timer, so a fired timer can tell a live transfer from
    /// one that reused the same txnid after wraparound (see `DESIGN.md`).
    pub generation: u64,
    pub cmd: Cmd,
    pub file: File,
    pub file_size: u64,
    pub blksize: u32,
    pub bytes_remaining: u64,
    pub status_fd: OwnedFd,
    pub dest: Destination,
    pub client_pid: Option<u32>,
    pub defer: Deferral,
}

impl HasTxnId for Transfer {
    fn txnid(&self) -> u64 {
        self.txnid
    }
}

impl Transfer {
    /// `true` if the status channel is distinct from the destination
    /// channel (`SEND`) rather than being the same fd (`READ`).
    pub fn has_stat_channel(&self) -> bool {
        matches!(self.dest, Destination::Fd(_))
    }

    pub fn dest_fd(&self) -> BorrowedFd<'_> {
        match &self.dest {
            Destination::SameAsStatus => self.status_fd.as_fd(),
            Destination::Fd(fd) => fd.as_fd(),
            Destination::None => panic!("transfer has no destination descriptor yet"),
        }
    }
}

/// A one-shot timer guarding a `FILE_OPEN`ed-but-not-yet-sent transfer.
pub struct Timer {
    pub txnid: u64,
    pub generation: u64,
    pub handle: TimerHandle,
}

impl HasTxnId for Timer {
    fn txnid(&self) -> u64 {
        self.txnid
    }
}

/// A terminal response PDU whose first delivery attempt failed
/// transiently, buffered for retry.
pub struct PendingResponse {
    pub stat_fd: OwnedFd,
    pub pdu: Vec<u8>,
}
