//! Poller abstraction (C3): edge-triggered readiness, one-shot per-resource
//! timers, and an authoritative termination event — backed on Linux by
//! `epoll`, `timerfd`, and `signalfd`.
//!
//! The original daemon tags its `epoll_data` pointer by reading the first
//! field of whatever struct it points to (a `tag` enum shared by every
//! resource type, see `server_resources.h`'s type-punning note). Rust has
//! no sound equivalent of that, so registrations instead carry a `Token`
//! packed directly into the 64-bit `epoll_data` word: a `ResourceKind`
//! discriminant in the high byte, an opaque `id` (a txnid, in practice) in
//! the rest. The token is never a pointer — always a lookup key into
//! whichever table `kind` designates.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

/// What kind of resource an event's token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceKind {
    /// The request-receiving socket.
    Request = 0,
    /// A live transfer's destination descriptor.
    Transfer = 1,
    /// A per-open-file timeout timer.
    Timer = 2,
    /// A buffered terminal response awaiting retry.
    PendingResponse = 3,
}

impl ResourceKind {
    fn from_u8(v: u8) -> Option<ResourceKind> {
        match v {
            0 => Some(ResourceKind::Request),
            1 => Some(ResourceKind::Transfer),
            2 => Some(ResourceKind::Timer),
            3 => Some(ResourceKind::PendingResponse),
            _ => None,
        }
    }
}

/// A lookup key carried in the epoll `u64` user-data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: ResourceKind,
    pub id: u64,
}

const ID_BITS: u32 = 56;
const ID_MASK: u64 = (1 << ID_BITS) - 1;

impl Token {
    pub fn new(kind: ResourceKind, id: u64) -> Token {
        assert!(id <= ID_MASK, "token id exceeds 56 bits");
        Token { kind, id }
    }

    fn pack(self) -> u64 {
        ((self.kind as u64) << ID_BITS) | (self.id & ID_MASK)
    }

    fn unpack(raw: u64) -> Option<Token> {
        let kind = ResourceKind::from_u8((raw >> ID_BITS) as u8)?;
        Some(Token {
            kind,
            id: raw & ID_MASK,
        })
    }
}

bitflags::bitflags! {
    /// Mirrors `SYSPOLL_{READ,WRITE,ERROR,TERM}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        const TERM = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub readiness: Readiness,
    pub token: Token,
}

pub struct Poller {
    epoll: Epoll,
    term_signal: SignalFd,
    events_buf: Vec<EpollEvent>,
    translated: Vec<Event>,
}

const TERM_TOKEN: Token = Token {
    kind: ResourceKind::Request,
    id: u64::MAX,
};

impl Poller {
    /// Creates a poller and registers the termination signal source
    /// (`SIGTERM`/`SIGINT`) so that it is always the first thing a caller
    /// can observe.
    pub fn new(max_events: usize) -> io::Result<Poller> {
        let epoll = Epoll::new(EpollCreateFlags::empty())?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.thread_block().map_err(nix_to_io)?;

        let term_signal =
            SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).map_err(nix_to_io)?;

        epoll
            .add(
                term_signal.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, term_event_token().pack()),
            )
            .map_err(nix_to_io)?;

        Ok(Poller {
            epoll,
            term_signal,
            events_buf: vec![EpollEvent::empty(); max_events.max(1)],
            translated: Vec::with_capacity(max_events.max(1)),
        })
    }

    /// Registers `fd` for edge-triggered readability.
    pub fn register_read(&self, fd: BorrowedFd<'_>, token: Token) -> io::Result<()> {
        self.epoll
            .add(
                fd,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, token.pack()),
            )
            .map_err(nix_to_io)
    }

    /// Registers `fd` for edge-triggered writability — the mode every live
    /// transfer's destination descriptor and every buffered response uses.
    pub fn register_write(&self, fd: BorrowedFd<'_>, token: Token) -> io::Result<()> {
        self.epoll
            .add(
                fd,
                EpollEvent::new(EpollFlags::EPOLLOUT | EpollFlags::EPOLLET, token.pack()),
            )
            .map_err(nix_to_io)
    }

    /// Deregisters `fd`. Must be called before closing a descriptor shared
    /// with the client's file table (destination fds received via
    /// `SCM_RIGHTS`), or a stale entry can resurface from a subsequent
    /// `wait`/`poll` after the associated memory has been freed.
    pub fn deregister(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        match self.epoll.delete(fd) {
            Ok(()) => Ok(()),
            // Already gone (e.g. client closed their end first) — not an error here.
            Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::EBADF) => Ok(()),
            Err(e) => Err(nix_to_io(e)),
        }
    }

    /// Arms a one-shot timer and registers it for readiness, returning the
    /// backing `TimerFd` (the caller owns it and must keep it alive and
    /// eventually close it, typically via `TimerHandle`).
    pub fn add_timer(&self, millis: u64, token: Token) -> io::Result<TimerHandle> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .map_err(nix_to_io)?;
        timer
            .set(
                Expiration::OneShot(Duration::from_millis(millis).into()),
                TimerSetTimeFlags::empty(),
            )
            .map_err(nix_to_io)?;

        self.epoll
            .add(
                timer.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, token.pack()),
            )
            .map_err(nix_to_io)?;

        Ok(TimerHandle { timer })
    }

    /// Blocks indefinitely for at least one event.
    ///
    /// Returns an owned `Vec` (not a borrow of internal state) so callers
    /// can freely mutate the rest of the server while processing events.
    pub fn wait(&mut self) -> io::Result<Vec<Event>> {
        self.wait_with_timeout(None)
    }

    /// Returns immediately, even if nothing is ready — used when there is
    /// deferred work pending so the secondary pass isn't starved.
    pub fn poll(&mut self) -> io::Result<Vec<Event>> {
        self.wait_with_timeout(Some(Duration::ZERO))
    }

    fn wait_with_timeout(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        use nix::sys::epoll::EpollTimeout;

        let timeout = match timeout {
            Some(d) => {
                let millis = d.as_millis().min(u16::MAX as u128) as u16;
                EpollTimeout::from(millis)
            }
            None => EpollTimeout::NONE,
        };

        loop {
            match self.epoll.wait(&mut self.events_buf, timeout) {
                Ok(n) => {
                    translate_events(&self.events_buf[..n], &mut self.translated);
                    return Ok(self.translated.clone());
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(nix_to_io(e)),
            }
        }
    }
}

/// A live timer registration. Dropping it closes the underlying `timerfd`.
pub struct TimerHandle {
    timer: TimerFd,
}

impl TimerHandle {
    pub fn as_raw_fd(&self) -> RawFd {
        self.timer.as_fd().as_raw_fd()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }
}

fn term_event_token() -> Token {
    TERM_TOKEN
}

fn translate_events(raw: &[EpollEvent], out: &mut Vec<Event>) {
    out.clear();
    for ev in raw {
        let flags = ev.events();
        let Some(token) = Token::unpack(ev.data()) else {
            continue;
        };

        if token == TERM_TOKEN {
            out.push(Event {
                readiness: Readiness::TERM,
                token,
            });
            continue;
        }

        let mut readiness = Readiness::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            readiness |= Readiness::READ;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            readiness |= Readiness::WRITE;
        }
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            readiness |= Readiness::ERROR;
        }
        out.push(Event { readiness, token });
    }
}

fn nix_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
