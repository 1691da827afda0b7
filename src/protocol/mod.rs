//! Wire codec (C1): request/response PDU encode and decode.
//!
//! Header layout shared by every frame: command byte, status byte (0 = OK,
//! otherwise an OS errno clamped into `0..=255`), 8-byte little-endian body
//! length. Request commands have bit 7 clear; response commands have it
//! set.

pub mod header;
pub mod request;
pub mod response;

pub use header::{Header, HEADER_SIZE};
pub use request::{FileRequestKind, Request};
pub use response::{FileInfo, XferStat};
