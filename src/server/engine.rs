//! Primary/secondary event passes (§4.6.2/§4.6.3), the budgeted transfer
//! loop (§4.6.4), and terminal-response retry (§4.6.5).
//!
//! Grounded on `server.c`'s `process_events`/`process_deferred`/
//! `transfer_file`/`send_terminal_resp`.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use log::{error, warn};

use crate::error;
use crate::fileio;
use crate::poller::{Event, ResourceKind, Readiness, Token};
use crate::protocol::response::{self, XferStat};
use crate::transport::PeerListener;

use super::resources::{Cmd, Deferral, Destination, PendingResponse, Transfer};
use super::Server;

/// What a single `transfer_file` call accomplished.
enum Burst {
    /// Transient error (or nothing left to write before the budget ran
    /// out): stay alive, await the next writability event.
    AwaitingWritability,
    /// Saturated the per-call pipe-capacity budget: stay alive, revisit in
    /// the secondary pass.
    SaturatedBudget,
    /// Finished — either complete or a fatal error. The transfer is torn
    /// down by the caller; `pdu` is the terminal message to deliver, if
    /// this transfer has a distinct status channel.
    Terminal { pdu: Option<Vec<u8>> },
}

impl Server {
    /// Processes one batch of poller events (§4.6.2). Ends the loop
    /// (`self.running = false`) on `TERM` or a fatal request-socket error.
    pub(super) fn process_events(&mut self, events: &[Event]) {
        for ev in events {
            if ev.readiness.contains(Readiness::TERM) {
                self.running = false;
                return;
            }

            match ev.token.kind {
                ResourceKind::Request => {
                    let error_event = ev.readiness.contains(Readiness::ERROR);
                    if error_event || !self.handle_request_socket() {
                        error!("fatal error on request socket; shutting down");
                        self.running = false;
                        return;
                    }
                }
                ResourceKind::Timer => self.handle_timer_fired(ev.token.id),
                ResourceKind::PendingResponse => {
                    self.handle_pending_response_ready(ev.token.id, ev.readiness.contains(Readiness::ERROR))
                }
                ResourceKind::Transfer => {
                    self.handle_transfer_ready(ev.token.id, ev.readiness.contains(Readiness::ERROR))
                }
            }
        }
    }

    /// Secondary pass (§4.6.3) over the deferred list: cancellations are
    /// torn down unconditionally; `READY` transfers get another budgeted
    /// burst and either stay deferred, return to primary processing, or
    /// are torn down if that burst was terminal.
    pub(super) fn process_deferred(&mut self) {
        let mut i = 0;
        while i < self.deferred.len() {
            let txnid = self.deferred[i];

            let defer_state = match self.xfers.find(txnid) {
                Some(xfer) => xfer.defer,
                None => {
                    self.deferred.swap_remove(i);
                    continue;
                }
            };

            match defer_state {
                Deferral::Cancel => {
                    self.undefer_at(i);
                    self.teardown_registered(txnid);
                }
                Deferral::Ready => {
                    if !self.transfer_file(txnid) {
                        self.undefer_at(i);
                        self.teardown_registered(txnid);
                    } else {
                        let still_deferred = self
                            .xfers
                            .find(txnid)
                            .map(|x| x.defer != Deferral::None)
                            .unwrap_or(false);
                        if still_deferred {
                            i += 1;
                        } else {
                            self.undefer_at(i);
                        }
                    }
                }
                Deferral::None => {
                    error!("non-deferred transfer (txnid {txnid}) found in deferred list");
                    self.undefer_at(i);
                }
            }
        }
    }

    /// A fired open-file timer: cancels the transfer only if it never
    /// began moving data (`bytes_remaining == file_size`) and its
    /// generation still matches (rules out txnid reuse after wraparound).
    fn handle_timer_fired(&mut self, txnid: u64) {
        let Some(timer) = self.timers.remove(txnid) else {
            return;
        };

        let should_cancel = {
            match self.xfers.find(txnid) {
                None => false,
                Some(xfer) if xfer.generation != timer.generation => {
                    warn!("expired timer has mismatched generation for txnid {txnid} (wrapped?)");
                    false
                }
                Some(xfer) if xfer.bytes_remaining == xfer.file_size => {
                    let pdu = response::error_response(response::cmd::XFER_STAT, libc::ETIMEDOUT as u8);
                    let _ = PeerListener::send_to_fd(xfer.status_fd.as_fd(), &pdu);
                    true
                }
                Some(_) => false,
            }
        };

        let _ = self.poller.deregister(timer.handle.as_fd());
        drop(timer);

        if should_cancel {
            self.defer_xfer(txnid, Deferral::Cancel);
        }
    }

    /// A buffered terminal response's status fd became writable again:
    /// retry the write once.
    fn handle_pending_response_ready(&mut self, id: u64, error_event: bool) {
        let Some(resp) = self.pending_responses.get(&id) else {
            return;
        };

        let done = error_event
            || match PeerListener::send_to_fd(resp.stat_fd.as_fd(), &resp.pdu) {
                Ok(_) => true,
                Err(e) => error::is_fatal(&e),
            };

        if done {
            if let Some(resp) = self.pending_responses.remove(&id) {
                let _ = self.poller.deregister(resp.stat_fd.as_fd());
            }
        }
    }

    /// A live transfer's destination became writable.
    fn handle_transfer_ready(&mut self, txnid: u64, error_event: bool) {
        let defer_state = match self.xfers.find(txnid) {
            Some(xfer) => xfer.defer,
            None => return,
        };

        // CANCEL is torn down by the secondary pass; READY is already mid
        // processing there — neither should be re-driven here.
        if defer_state == Deferral::Cancel || defer_state == Deferral::Ready {
            return;
        }

        let alive = !error_event && self.transfer_file(txnid);
        if !alive {
            self.teardown_registered(txnid);
        }
    }

    /// Drives one budgeted burst of `transfer_file` for `txnid` (§4.6.4).
    /// Returns `true` if the transfer is still alive afterward, `false` if
    /// it reached a terminal state (the caller tears it down).
    fn transfer_file(&mut self, txnid: u64) -> bool {
        let burst = match self.xfers.find_mut(txnid) {
            Some(xfer) => run_burst(xfer),
            None => return false,
        };

        match burst {
            Burst::AwaitingWritability => true,
            Burst::SaturatedBudget => {
                let already_deferred = self
                    .xfers
                    .find(txnid)
                    .map(|x| x.defer != Deferral::None)
                    .unwrap_or(false);
                if !already_deferred {
                    self.defer_xfer(txnid, Deferral::Ready);
                }
                true
            }
            Burst::Terminal { pdu } => {
                if let Some(pdu) = pdu {
                    self.send_terminal_response(txnid, &pdu);
                }
                false
            }
        }
    }

    /// Delivers a terminal `XFER_STAT` reliably (§4.6.5): one inline
    /// attempt, then — on transient failure only — a `dup`'d retry
    /// registered with the poller, independent of the transfer's own
    /// imminent teardown.
    fn send_terminal_response(&mut self, txnid: u64, pdu: &[u8]) {
        let Some(xfer) = self.xfers.find(txnid) else {
            return;
        };
        let stat_fd = xfer.status_fd.as_fd();

        match PeerListener::send_to_fd(stat_fd, pdu) {
            Ok(_) => return,
            Err(e) if !error::is_fatal(&e) => { /* fall through to retry */ }
            Err(_) => return, // fatal: client will observe EOF on a closed fd
        }

        let dup_fd = match nix::unistd::dup(stat_fd.as_raw_fd()) {
            Ok(raw) => unsafe { OwnedFd::from_raw_fd(raw) },
            Err(e) => {
                error!("unable to dup status fd for terminal response retry (txnid {txnid}): {e}");
                return;
            }
        };

        let resp_id = self.next_resp_id();
        let token = Token::new(ResourceKind::PendingResponse, resp_id);
        if let Err(e) = self.poller.register_write(dup_fd.as_fd(), token) {
            error!("unable to register status fd for terminal response retry (txnid {txnid}): {e}");
            return; // dup_fd drops here, closing it
        }

        self.pending_responses.insert(
            resp_id,
            PendingResponse {
                stat_fd: dup_fd,
                pdu: pdu.to_vec(),
            },
        );
    }

    fn undefer_at(&mut self, i: usize) {
        let txnid = self.deferred[i];
        if let Some(xfer) = self.xfers.find_mut(txnid) {
            xfer.defer = Deferral::None;
        }
        self.deferred.swap_remove(i);
    }

    /// Mirrors `delete_registered_xfer`: erase from the table, deregister
    /// the destination (mandatory — it is shared with the client's file
    /// table, see spec.md §5), then drop, closing every owned fd.
    fn teardown_registered(&mut self, txnid: u64) {
        if let Some(xfer) = self.xfers.remove(txnid) {
            if !matches!(xfer.cmd, Cmd::Opened) {
                let _ = self.poller.deregister(xfer.dest_fd());
            }
        }
    }

    /// Marks a transfer for the secondary pass. Mirrors `defer_xfer`: only
    /// pushes onto the deferred list the first time — `Cancel` can
    /// supersede an already-queued `Ready` in place without a duplicate
    /// entry.
    pub(super) fn defer_xfer(&mut self, txnid: u64, how: Deferral) {
        let Some(xfer) = self.xfers.find_mut(txnid) else {
            return;
        };
        let already_queued = xfer.defer != Deferral::None;
        xfer.defer = how;
        if !already_queued {
            self.deferred.push(txnid);
        }
    }
}

/// The per-call budgeted byte-moving loop, operating on a single transfer
/// already looked up in the table. Pure with respect to `Server` — it only
/// touches `xfer` and, for non-terminal progress notifications, the status
/// fd it already owns — so the caller stays free of borrow conflicts
/// against other `Server` fields.
fn run_burst(xfer: &mut Transfer) -> Burst {
    let pipe_cap = fileio::pipe_capacity() as u64;
    let is_pipe_dest = matches!(xfer.dest, Destination::SameAsStatus);
    let mut total_written: u64 = 0;

    loop {
        let write_size = (xfer.blksize as u64)
            .min(xfer.bytes_remaining)
            .min(pipe_cap.saturating_sub(total_written));

        if write_size == 0 {
            return Burst::SaturatedBudget;
        }

        let result = fileio::move_bytes(is_pipe_dest, xfer.file.as_fd(), xfer.dest_fd(), write_size as usize);

        match result {
            Ok(n) => {
                let n = n as u64;
                xfer.bytes_remaining -= n;
                total_written += n;

                if xfer.bytes_remaining == 0 {
                    xfer.defer = Deferral::None;
                    let pdu = xfer.has_stat_channel().then(|| XferStat::complete().encode());
                    return Burst::Terminal { pdu };
                }

                if total_written >= pipe_cap {
                    return Burst::SaturatedBudget;
                }
                // else loop again — still within budget, more to send.
            }
            Err(e) if !error::is_fatal(&e) => {
                if xfer.has_stat_channel() {
                    let pdu = XferStat { size: total_written }.encode();
                    // Best-effort notification: a transient failure here is
                    // ignored, but a fatal one means the status channel
                    // itself is gone and the transfer must be torn down.
                    if let Err(send_err) = PeerListener::send_to_fd(xfer.status_fd.as_fd(), &pdu) {
                        if error::is_fatal(&send_err) {
                            return Burst::Terminal { pdu: None };
                        }
                    }
                }
                xfer.defer = Deferral::None;
                return Burst::AwaitingWritability;
            }
            Err(e) => {
                let pdu = xfer
                    .has_stat_channel()
                    .then(|| response::error_response(response::cmd::XFER_STAT, error::to_status_byte(&e)));
                return Burst::Terminal { pdu };
            }
        }
    }
}
