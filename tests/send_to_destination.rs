//! End-to-end `SEND`: the client attaches a status channel and a distinct
//! destination, and receives `FILE_INFO` plus a terminal `XFER_STAT` on the
//! status channel while the file's bytes land on the destination.

mod common;

use std::io::Write;
use std::os::fd::AsFd;
use std::time::Duration;

use filed::protocol::{FileInfo, FileRequestKind, Request, XferStat};

#[test]
fn send_delivers_file_info_xfer_stat_and_data_separately() {
    let server = common::start(10, 8, 5_000);

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let contents = vec![0xABu8; 200_000]; // larger than one pipe-capacity burst
    tmp.write_all(&contents).unwrap();

    let (status_read, status_write) = common::pipe();
    let (dest_here, dest_there) = common::socketpair();

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
    assert_eq!(info.size, contents.len() as u64);

    let data = common::read_exact(dest_here.as_fd(), contents.len(), Duration::from_secs(5)).unwrap();
    assert_eq!(data, contents);

    let stat_bytes = common::read_exact(status_read.as_fd(), 10 + 8, Duration::from_secs(5)).unwrap();
    let stat = XferStat::decode(&stat_bytes).unwrap();
    assert!(stat.is_complete());
}
