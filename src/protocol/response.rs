//! Response PDUs: `FILE_INFO`, `XFER_STAT`, and the bare error header.

use std::io;

use super::header::{Header, HEADER_SIZE};

pub mod cmd {
    pub const FILE_INFO: u8 = 0x81;
    pub const XFER_STAT: u8 = 0x82;
}

/// Sentinel `size` value in an `XFER_STAT` body meaning "transfer complete".
pub const XFER_COMPLETE: u64 = u64::MAX;

/// Acknowledges `READ`/`SEND`/`FILE_OPEN` with file metadata and the
/// assigned transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub txnid: u64,
}

impl FileInfo {
    pub fn encode(&self) -> Vec<u8> {
        let hdr = Header {
            cmd: cmd::FILE_INFO,
            status: 0,
            body_len: 8 * 5,
        };
        let mut buf = hdr.to_bytes().to_vec();
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.atime.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.ctime.to_le_bytes());
        buf.extend_from_slice(&self.txnid.to_le_bytes());
        buf
    }

    /// Decodes a `FILE_INFO` frame. A non-OK status decodes to `Err`
    /// carrying that status as the OS errno, rather than `Ok` of a bogus
    /// body — callers (chiefly test clients) should match on the error to
    /// distinguish a request failure from a malformed frame.
    pub fn decode(buf: &[u8]) -> io::Result<FileInfo> {
        let hdr = Header::from_bytes(buf)?;
        if hdr.cmd != cmd::FILE_INFO {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a FILE_INFO frame"));
        }
        if hdr.status != 0 {
            return Err(io::Error::from_raw_os_error(hdr.status as i32));
        }
        let body = &buf[HEADER_SIZE..];
        if body.len() < 40 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "FILE_INFO body too short"));
        }
        Ok(FileInfo {
            size: read_u64(&body[0..8]),
            atime: read_u64(&body[8..16]) as i64,
            mtime: read_u64(&body[16..24]) as i64,
            ctime: read_u64(&body[24..32]) as i64,
            txnid: read_u64(&body[32..40]),
        })
    }
}

fn read_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    u64::from_le_bytes(buf)
}

/// Transfer progress or completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferStat {
    /// Bytes written since the previous notification, or `XFER_COMPLETE`.
    pub size: u64,
}

impl XferStat {
    pub fn complete() -> XferStat {
        XferStat {
            size: XFER_COMPLETE,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.size == XFER_COMPLETE
    }

    pub fn encode(&self) -> Vec<u8> {
        let hdr = Header {
            cmd: cmd::XFER_STAT,
            status: 0,
            body_len: 8,
        };
        let mut buf = hdr.to_bytes().to_vec();
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decodes an `XFER_STAT` frame; see `FileInfo::decode` for the
    /// non-OK-status convention.
    pub fn decode(buf: &[u8]) -> io::Result<XferStat> {
        let hdr = Header::from_bytes(buf)?;
        if hdr.cmd != cmd::XFER_STAT {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an XFER_STAT frame"));
        }
        if hdr.status != 0 {
            return Err(io::Error::from_raw_os_error(hdr.status as i32));
        }
        let body = &buf[HEADER_SIZE..];
        if body.len() < 8 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "XFER_STAT body too short"));
        }
        Ok(XferStat {
            size: read_u64(&body[0..8]),
        })
    }
}

/// An error-only response: header with a non-zero status, no body.
pub fn error_response(cmd: u8, errno_status: u8) -> Vec<u8> {
    Header {
        cmd,
        status: errno_status,
        body_len: 0,
    }
    .to_bytes()
    .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xfer_stat_complete_round_trips() {
        let stat = XferStat::complete();
        let bytes = stat.encode();
        let hdr = Header::from_bytes(&bytes).unwrap();
        assert_eq!(hdr.cmd, cmd::XFER_STAT);
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&bytes[super::super::header::HEADER_SIZE..]);
        assert_eq!(u64::from_le_bytes(size_bytes), XFER_COMPLETE);
        assert!(stat.is_complete());
    }

    #[test]
    fn file_info_encodes_expected_length() {
        let info = FileInfo {
            size: 100,
            atime: 1,
            mtime: 2,
            ctime: 3,
            txnid: 4,
        };
        let bytes = info.encode();
        assert_eq!(bytes.len(), super::super::header::HEADER_SIZE + 40);
    }

    #[test]
    fn file_info_round_trips() {
        let info = FileInfo {
            size: 100,
            atime: 1,
            mtime: 2,
            ctime: 3,
            txnid: 4,
        };
        assert_eq!(FileInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn xfer_stat_round_trips() {
        let stat = XferStat { size: 77 };
        assert_eq!(XferStat::decode(&stat.encode()).unwrap(), stat);
    }

    #[test]
    fn decode_surfaces_error_status() {
        let bytes = error_response(cmd::FILE_INFO, libc::ETIMEDOUT as u8);
        let err = FileInfo::decode(&bytes).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    }
}
