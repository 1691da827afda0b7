//! Boundary and validation checks from spec.md §8 that don't fit the
//! six literal end-to-end scenarios: zero-length files, out-of-range
//! offset/len, and transfer-table capacity exhaustion.

mod common;

use std::io::Write;
use std::os::fd::AsFd;
use std::time::Duration;

use filed::protocol::{FileInfo, FileRequestKind, Request};

#[test]
fn zero_length_file_is_rejected() {
    let server = common::start(60, 8, 5_000);

    let tmp = tempfile::NamedTempFile::new().unwrap(); // empty

    let (read_end, write_end) = common::pipe();
    let req = Request::File {
        kind: FileRequestKind::Read,
        offset: 0,
        len: 0,
        filename: std::ffi::CString::new(tmp.path().to_str().unwrap()).unwrap(),
    };
    common::send(&server.socket_path, &req.encode(), &[write_end.as_fd()]).unwrap();
    drop(write_end);

    let bytes = common::read_exact(read_end.as_fd(), 10, Duration::from_secs(2)).unwrap();
    let err = FileInfo::decode(&bytes).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn out_of_range_offset_len_is_rejected() {
    let server = common::start(61, 8, 5_000);

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"0123456789").unwrap(); // 10 bytes

    let (read_end, write_end) = common::pipe();
    let req = Request::File {
        kind: FileRequestKind::Read,
        offset: 5,
        len: 10, // 5 + 10 > 10
        filename: std::ffi::CString::new(tmp.path().to_str().unwrap()).unwrap(),
    };
    common::send(&server.socket_path, &req.encode(), &[write_end.as_fd()]).unwrap();
    drop(write_end);

    let bytes = common::read_exact(read_end.as_fd(), 10, Duration::from_secs(2)).unwrap();
    let err = FileInfo::decode(&bytes).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ERANGE));
}

#[test]
fn transfer_table_at_capacity_refuses_further_opens() {
    let server = common::start(62, 2, 5_000);

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"0123456789").unwrap();

    // Fill both slots with FILE_OPEN, which holds its transfer open
    // indefinitely (subject to the timeout) without consuming it.
    let mut held_pipes = Vec::new();
    for _ in 0..2 {
        let (read_end, write_end) = common::pipe();
        let req = Request::File {
            kind: FileRequestKind::FileOpen,
            offset: 0,
            len: 0,
            filename: std::ffi::CString::new(tmp.path().to_str().unwrap()).unwrap(),
        };
        common::send(&server.socket_path, &req.encode(), &[write_end.as_fd()]).unwrap();
        drop(write_end);
        let bytes = common::read_exact(read_end.as_fd(), 10 + 40, Duration::from_secs(2)).unwrap();
        FileInfo::decode(&bytes).unwrap();
        held_pipes.push(read_end);
    }

    // A third request finds the table full.
    let (read_end, write_end) = common::pipe();
    let req = Request::File {
        kind: FileRequestKind::Read,
        offset: 0,
        len: 0,
        filename: std::ffi::CString::new(tmp.path().to_str().unwrap()).unwrap(),
    };
    common::send(&server.socket_path, &req.encode(), &[write_end.as_fd()]).unwrap();
    drop(write_end);

    let bytes = common::read_exact(read_end.as_fd(), 10, Duration::from_secs(2)).unwrap();
    let err = FileInfo::decode(&bytes).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
}
