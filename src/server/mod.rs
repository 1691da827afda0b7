//! Transfer engine & event loop (C6).
//!
//! Grounded on `server.c`'s `srv_new`/`srv_run`/`srv_delete`: a single
//! `Server` owns every live resource, alternates a primary event-driven pass
//! (`process_events`) with a secondary deferred pass (`process_deferred`)
//! whenever the deferred list is non-empty, and tears everything down on
//! `SIGTERM`/`SIGINT` or a fatal poller error.

mod dispatch;
mod engine;
pub mod resources;

use std::collections::HashMap;
use std::io;

use log::{info, warn};

use crate::config::Config;
use crate::poller::{Poller, ResourceKind, Token};
use crate::protocol::request::MAX_REQUEST_SIZE;
use crate::transport::PeerListener;
use crate::xfer_table::XferTable;

use resources::{PendingResponse, Timer, Transfer};

/// Owns every live transfer, timer, and buffered response, and drives the
/// event loop to completion.
pub struct Server {
    config: Config,
    uid: u32,
    poller: Poller,
    listener: PeerListener,
    xfers: XferTable<Transfer>,
    timers: XferTable<Timer>,
    pending_responses: HashMap<u64, PendingResponse>,
    /// Txnids queued for the secondary pass — cancellation or I/O-budget
    /// fairness. A plain `Vec`, not raw pointers: looked back up through
    /// `xfers`/`pending_responses` each time it's walked.
    deferred: Vec<u64>,
    next_txnid: u64,
    next_resp_id: u64,
    next_generation: u64,
    recv_buf_size: usize,
    running: bool,
}

impl Server {
    /// Binds the listening socket and constructs an empty server ready to
    /// `run()`. `uid` is the peer uid every request must match — requests
    /// from any other uid are rejected with `EACCES` (see `dispatch.rs`).
    pub fn new(config: Config, uid: u32) -> io::Result<Server> {
        config.validate()?;

        let listener = PeerListener::bind(&config.socket_dir, &config.server_name, config.instance)?;
        // Transfers and their timers share a capacity; events_buf is sized
        // generously since both tables plus the listener and any pending
        // retries can all be ready in the same wait().
        let max_events = config.max_transfers.saturating_mul(2) + 8;
        let poller = Poller::new(max_events)?;

        poller.register_read(listener.as_fd(), Token::new(ResourceKind::Request, 0))?;

        Ok(Server {
            xfers: XferTable::new(config.max_transfers),
            timers: XferTable::new(config.max_transfers),
            pending_responses: HashMap::new(),
            deferred: Vec::new(),
            next_txnid: 1,
            next_resp_id: 0,
            next_generation: 0,
            recv_buf_size: MAX_REQUEST_SIZE,
            running: true,
            config,
            uid,
            poller,
            listener,
        })
    }

    /// Runs the event loop until `SIGTERM`/`SIGINT` or a fatal poller error.
    ///
    /// Mirrors `srv_run`: when the deferred list is empty, blocks in
    /// `poller.wait()`; otherwise uses `poller.poll()` (zero timeout) so
    /// deferred work is revisited promptly instead of waiting for the next
    /// readiness event that may never come (e.g. a cancelled transfer whose
    /// destination never becomes writable again).
    pub fn run(&mut self) -> io::Result<()> {
        info!("filed entering event loop, pid={}", crate::config::pid());

        while self.running {
            let events = if self.deferred.is_empty() {
                self.poller.wait()?
            } else {
                self.poller.poll()?
            };

            self.process_events(&events);

            if !self.deferred.is_empty() {
                self.process_deferred();
            }
        }

        info!("filed leaving event loop");
        Ok(())
    }

    fn next_txnid(&mut self) -> u64 {
        let id = self.next_txnid;
        self.next_txnid = self.next_txnid.wrapping_add(1);
        id
    }

    fn next_generation(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        g
    }

    fn next_resp_id(&mut self) -> u64 {
        let id = self.next_resp_id;
        self.next_resp_id = self.next_resp_id.wrapping_add(1);
        id
    }
}

impl Drop for Server {
    /// Mirrors `srv_delete`: every live transfer's destination (and timer,
    /// if still pending) must be deregistered from the poller before its
    /// `OwnedFd` drops closes it, or a stale epoll entry can resurface.
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            let _ = self.poller.deregister(timer.handle.as_fd());
        }
        for xfer in self.xfers.iter() {
            // `Opened` transfers have no destination registered yet (only
            // their `Timer`, handled above); `Read`/`Send` always do.
            if !matches!(xfer.cmd, resources::Cmd::Opened) {
                let _ = self.poller.deregister(xfer.dest_fd());
            }
        }
        for resp in self.pending_responses.values() {
            let _ = self
                .poller
                .deregister(std::os::fd::AsFd::as_fd(&resp.stat_fd));
        }
        let _ = self.poller.deregister(self.listener.as_fd());
        warn!("filed shutting down");
    }
}
