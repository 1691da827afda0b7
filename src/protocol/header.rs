//! The two-byte-plus-length header shared by every PDU.

use std::io;

/// Size of a marshaled header: one command byte, one status byte, eight
/// little-endian body-length bytes.
pub const HEADER_SIZE: usize = 10;

/// A decoded PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub cmd: u8,
    pub status: u8,
    pub body_len: u64,
}

impl Header {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.cmd;
        buf[1] = self.status;
        buf[2..10].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "buffer too small for PDU header",
            ));
        }
        let mut body_len_bytes = [0u8; 8];
        body_len_bytes.copy_from_slice(&buf[2..10]);
        Ok(Header {
            cmd: buf[0],
            status: buf[1],
            body_len: u64::from_le_bytes(body_len_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let hdr = Header {
            cmd: 0x81,
            status: 0,
            body_len: 42,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(Header::from_bytes(&bytes).unwrap(), hdr);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(Header::from_bytes(&[0u8; 4]).is_err());
    }
}
