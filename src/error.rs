//! Errno classification and status-byte mapping for the wire protocol.
//!
//! Mirrors the transient/fatal split a client-facing daemon needs: a
//! transient error on a single I/O attempt should not tear down a transfer,
//! while anything else is treated as unrecoverable for that transfer.

use std::io;

/// Returns `false` for the errno values considered transient, `true`
/// otherwise.
///
/// The transient set is exactly `EWOULDBLOCK`/`EAGAIN`, `ENFILE`,
/// `ENOBUFS`, `ENOLCK`, `ENOSPC` — the same five the original daemon
/// special-cases, no more and no fewer.
pub fn is_fatal(err: &io::Error) -> bool {
    !matches!(
        err.raw_os_error(),
        Some(libc::EWOULDBLOCK)
            | Some(libc::EAGAIN)
            | Some(libc::ENFILE)
            | Some(libc::ENOBUFS)
            | Some(libc::ENOLCK)
            | Some(libc::ENOSPC)
    )
}

/// Clamps an OS error into the single status byte the wire format carries.
///
/// Errno values outside `u8` range (none exist on Linux in practice) fall
/// back to `EIO` rather than silently truncating to an unrelated code.
pub fn to_status_byte(err: &io::Error) -> u8 {
    match err.raw_os_error() {
        Some(errno) if (0..=0xFF).contains(&errno) => errno as u8,
        _ => libc::EIO as u8,
    }
}

/// Builds an `io::Error` from a raw errno, the idiom used everywhere a
/// syscall result needs converting into the crate's `io::Result` currency.
pub fn from_errno(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errnos_are_not_fatal() {
        for errno in [
            libc::EWOULDBLOCK,
            libc::EAGAIN,
            libc::ENFILE,
            libc::ENOBUFS,
            libc::ENOLCK,
            libc::ENOSPC,
        ] {
            assert!(!is_fatal(&from_errno(errno)), "errno {errno} should be transient");
        }
    }

    #[test]
    fn other_errnos_are_fatal() {
        for errno in [libc::EINVAL, libc::ENOENT, libc::EACCES, libc::EIO] {
            assert!(is_fatal(&from_errno(errno)), "errno {errno} should be fatal");
        }
    }

    #[test]
    fn status_byte_clamps_to_u8() {
        assert_eq!(to_status_byte(&from_errno(libc::EACCES)), libc::EACCES as u8);
    }
}
