//! `SEND` whose destination is already closed: the first write attempt
//! fails with a fatal errno, and the status channel receives a non-OK
//! terminal `XFER_STAT` instead of a completion notice.

mod common;

use std::io::Write;
use std::os::fd::AsFd;
use std::time::Duration;

use filed::protocol::{FileInfo, FileRequestKind, Request, XferStat};

#[test]
fn send_reports_fatal_error_when_destination_is_closed() {
    let server = common::start(40, 8, 5_000);

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0x11u8; 4096]).unwrap();

    let (status_read, status_write) = common::pipe();
    let (dest_here, dest_there) = common::socketpair();
    drop(dest_here); // closed before the request even reaches the server

    let req = Request::File {
        kind: FileRequestKind::Send,
        offset: 0,
        len: 0,
        filename: std::ffi::CString::new(tmp.path().to_str().unwrap()).unwrap(),
    };
    common::send(
        &server.socket_path,
        &req.encode(),
        &[status_write.as_fd(), dest_there.as_fd()],
    )
    .unwrap();
    drop(status_write);
    drop(dest_there);

    let info_bytes = common::read_exact(status_read.as_fd(), 10 + 40, Duration::from_secs(2)).unwrap();
    let info = FileInfo::decode(&info_bytes).unwrap();
    assert_eq!(info.size, 4096);

    let err_bytes = common::read_exact(status_read.as_fd(), 10, Duration::from_secs(2)).unwrap();
    let err = XferStat::decode(&err_bytes).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPIPE));
}
