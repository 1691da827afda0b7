//! Request PDUs: `READ`, `SEND`, `FILE_OPEN` (shared body), `SEND_OPEN`,
//! `CANCEL`.

use std::io;

use super::header::{Header, HEADER_SIZE};

/// Request command codes. Bit 7 is clear, distinguishing these from
/// response codes.
pub mod cmd {
    pub const FILE_OPEN: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const SEND: u8 = 0x03;
    pub const SEND_OPEN: u8 = 0x04;
    pub const CANCEL: u8 = 0x05;
}

/// Maximum filename length, excluding the terminating NUL.
pub const FILENAME_MAX: usize = 512;

/// Minimum body size for a `READ`/`SEND`/`FILE_OPEN` request: 8-byte
/// offset, 8-byte len, one filename byte, one NUL.
const FILE_REQ_MIN_BODY: usize = 8 + 8 + 1 + 1;

/// Largest possible request frame: header + offset + len + max filename + NUL.
pub const MAX_REQUEST_SIZE: usize = HEADER_SIZE + 8 + 8 + FILENAME_MAX + 1;

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `READ`/`SEND`/`FILE_OPEN` share this shape; `kind` distinguishes them.
    File {
        kind: FileRequestKind,
        offset: i64,
        /// `0` means "to end of file".
        len: u64,
        filename: std::ffi::CString,
    },
    SendOpen { txnid: u64 },
    Cancel { txnid: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRequestKind {
    Read,
    Send,
    FileOpen,
}

impl FileRequestKind {
    fn from_cmd(c: u8) -> Option<FileRequestKind> {
        match c {
            cmd::READ => Some(FileRequestKind::Read),
            cmd::SEND => Some(FileRequestKind::Send),
            cmd::FILE_OPEN => Some(FileRequestKind::FileOpen),
            _ => None,
        }
    }

    pub fn to_cmd(self) -> u8 {
        match self {
            FileRequestKind::Read => cmd::READ,
            FileRequestKind::Send => cmd::SEND,
            FileRequestKind::FileOpen => cmd::FILE_OPEN,
        }
    }
}

impl Request {
    /// Decodes a request frame, validating bounds per spec: minimum size,
    /// status must be OK, filename must be NUL-terminated and within
    /// `FILENAME_MAX`.
    pub fn decode(buf: &[u8]) -> io::Result<Request> {
        let hdr = Header::from_bytes(buf)?;

        if hdr.status != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request carried non-OK status",
            ));
        }

        let body = &buf[HEADER_SIZE..];

        match hdr.cmd {
            cmd::SEND_OPEN => {
                if body.len() < 8 {
                    return Err(too_short());
                }
                Ok(Request::SendOpen {
                    txnid: read_u64(body),
                })
            }
            cmd::CANCEL => {
                if body.len() < 8 {
                    return Err(too_short());
                }
                Ok(Request::Cancel {
                    txnid: read_u64(body),
                })
            }
            c => {
                let kind = FileRequestKind::from_cmd(c).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unrecognized request command {c:#x}"),
                    )
                })?;

                if body.len() < FILE_REQ_MIN_BODY {
                    return Err(too_short());
                }

                let offset = i64::from_le_bytes(body[0..8].try_into().unwrap());
                let len = u64::from_le_bytes(body[8..16].try_into().unwrap());
                let name_bytes = &body[16..];

                if *name_bytes.last().unwrap() != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "filename not NUL-terminated",
                    ));
                }

                let name_len = name_bytes.len() - 1;
                if name_len > FILENAME_MAX {
                    return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
                }

                let filename = std::ffi::CString::new(&name_bytes[..name_len])
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "embedded NUL"))?;

                Ok(Request::File {
                    kind,
                    offset,
                    len,
                    filename,
                })
            }
        }
    }

    /// Encodes a request frame (used by test clients, not by the server).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::File {
                kind,
                offset,
                len,
                filename,
            } => {
                let name = filename.as_bytes_with_nul();
                let body_len = (8 + 8 + name.len()) as u64;
                let hdr = Header {
                    cmd: kind.to_cmd(),
                    status: 0,
                    body_len,
                };
                let mut buf = hdr.to_bytes().to_vec();
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(name);
                buf
            }
            Request::SendOpen { txnid } => {
                let hdr = Header {
                    cmd: cmd::SEND_OPEN,
                    status: 0,
                    body_len: 8,
                };
                let mut buf = hdr.to_bytes().to_vec();
                buf.extend_from_slice(&txnid.to_le_bytes());
                buf
            }
            Request::Cancel { txnid } => {
                let hdr = Header {
                    cmd: cmd::CANCEL,
                    status: 0,
                    body_len: 8,
                };
                let mut buf = hdr.to_bytes().to_vec();
                buf.extend_from_slice(&txnid.to_le_bytes());
                buf
            }
        }
    }
}

fn read_u64(body: &[u8]) -> u64 {
    u64::from_le_bytes(body[0..8].try_into().unwrap())
}

fn too_short() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "request body too short")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_file_open() {
        let req = Request::File {
            kind: FileRequestKind::FileOpen,
            offset: 10,
            len: 0,
            filename: std::ffi::CString::new("/tmp/foo").unwrap(),
        };
        let bytes = req.encode();
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn round_trips_send_open_and_cancel() {
        let so = Request::SendOpen { txnid: 7 };
        assert_eq!(Request::decode(&so.encode()).unwrap(), so);
        let c = Request::Cancel { txnid: 9 };
        assert_eq!(Request::decode(&c.encode()).unwrap(), c);
    }

    #[test]
    fn rejects_missing_nul() {
        let req = Request::File {
            kind: FileRequestKind::Read,
            offset: 0,
            len: 0,
            filename: std::ffi::CString::new("x").unwrap(),
        };
        let mut bytes = req.encode();
        bytes.pop(); // drop trailing NUL
        assert!(Request::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_filename_over_max() {
        let long_name = "a".repeat(FILENAME_MAX + 1);
        let req = Request::File {
            kind: FileRequestKind::Read,
            offset: 0,
            len: 0,
            filename: std::ffi::CString::new(long_name).unwrap(),
        };
        let bytes = req.encode();
        let err = Request::decode(&bytes).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));
    }

    #[test]
    fn rejects_non_ok_status() {
        let req = Request::Cancel { txnid: 1 };
        let mut bytes = req.encode();
        bytes[1] = 5;
        assert!(Request::decode(&bytes).is_err());
    }
}
