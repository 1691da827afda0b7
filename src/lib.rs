//! `filed`: a local file I/O delegation daemon.
//!
//! A single-threaded, `epoll`-driven server listens on a `SOCK_DGRAM` UNIX
//! socket for requests naming a file and an offset/length range, opens the
//! file under a byte-range lock, and streams its bytes to a client-supplied
//! descriptor with `splice`/`sendfile` — without ever copying the data
//! through userspace. See `README`/`SPEC_FULL.md` for the wire protocol and
//! `server::Server` for the transfer engine itself.

pub mod config;
pub mod error;
pub mod fileio;
pub mod poller;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod xfer_table;

pub use config::Config;
pub use server::Server;
