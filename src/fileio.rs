//! File I/O engine (C5): open a file read-only under a byte-range lock,
//! and move its bytes to a destination descriptor using the kernel's
//! zero-copy primitives.
//!
//! Grounded on `file_io.c` (open + `fstat` + `F_SETLK` + `lseek`) and
//! `file_io_linux.c` (`splice`/`sendfile` dispatch). Only the Linux backend
//! is implemented — see `DESIGN.md` for why a userspace ring-buffer
//! fallback is out of scope here.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::FileTypeExt;
use std::sync::OnceLock;

use nix::fcntl::SpliceFFlags;
use nix::sys::sendfile::sendfile;
use nix::sys::stat::fstat;

/// Metadata captured at open time, used to size and account for the
/// transfer.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub blksize: u32,
}

/// Opens `path` read-only, validates it is a regular file or symlink
/// target, applies a read lock over `[offset, offset+len)` (`len == 0`
/// locks to EOF), and seeks to `offset`.
pub fn open_for_read(path: &std::ffi::CStr, offset: i64, len: u64) -> io::Result<(File, FileStat)> {
    let path = std::path::PathBuf::from(std::ffi::OsStr::new(
        path.to_str()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "filename is not UTF-8"))?,
    ));

    let file = File::open(&path)?;

    let st = fstat(file.as_fd()).map_err(nix_to_io)?;
    let file_type = file.metadata()?.file_type();
    if !file_type.is_file() && !file_type.is_symlink() {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }

    lock_range(file.as_fd(), offset, len as i64)?;

    if offset > 0 {
        use std::io::Seek;
        let mut f = &file;
        f.seek(io::SeekFrom::Start(offset as u64))?;
    }

    Ok((
        file,
        FileStat {
            size: st.st_size as u64,
            atime: st.st_atime,
            mtime: st.st_mtime,
            ctime: st.st_ctime,
            blksize: st.st_blksize as u32,
        },
    ))
}

fn lock_range(fd: BorrowedFd<'_>, offset: i64, len: i64) -> io::Result<()> {
    // `nix::fcntl` doesn't expose byte-range locks with an explicit
    // offset/length, only whole-file flock(2) semantics, so this one call
    // goes through `libc::fcntl` directly.
    let lock = libc::flock {
        l_type: libc::F_RDLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: offset as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETLK, &lock) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Moves up to `nbytes` bytes from `src` into a pipe at `dest` via
/// `splice(2)`. Used for `READ`, whose destination is always the status
/// fd doubling as a pipe.
pub fn splice_move(src: BorrowedFd<'_>, dest: BorrowedFd<'_>, nbytes: usize) -> io::Result<usize> {
    debug_assert!(nbytes > 0);
    nix::fcntl::splice(
        src,
        None,
        dest,
        None,
        nbytes,
        SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK,
    )
    .map_err(nix_to_io)
}

/// Moves up to `nbytes` bytes from `src` to `dest` via `sendfile(2)`. Used
/// for `SEND`/`SEND_OPEN`, whose destination is typically a socket.
pub fn sendfile_move(src: BorrowedFd<'_>, dest: BorrowedFd<'_>, nbytes: usize) -> io::Result<usize> {
    debug_assert!(nbytes > 0);
    sendfile(dest, src, None, nbytes).map_err(nix_to_io)
}

/// Dispatches to the right zero-copy primitive for `cmd`: `READ`'s
/// destination is always the status fd doubling as a pipe (`splice`);
/// `SEND`/`SEND_OPEN` target a client-supplied descriptor, typically a
/// socket (`sendfile`).
pub fn move_bytes(
    is_pipe_destination: bool,
    src: BorrowedFd<'_>,
    dest: BorrowedFd<'_>,
    nbytes: usize,
) -> io::Result<usize> {
    if is_pipe_destination {
        splice_move(src, dest, nbytes)
    } else {
        sendfile_move(src, dest, nbytes)
    }
}

/// The per-call I/O budget every transfer burst is capped at, so that no
/// single transfer can monopolize the event loop: the kernel pipe buffer
/// size (`F_GETPIPE_SZ`), probed once against a scratch pipe and cached,
/// falling back to 64KiB if the probe fails.
pub fn pipe_capacity() -> usize {
    static CAP: OnceLock<usize> = OnceLock::new();
    *CAP.get_or_init(|| {
        const FALLBACK: usize = 65536;
        match nix::unistd::pipe() {
            Ok((read_end, write_end)) => {
                let cap = unsafe { libc::fcntl(read_end.as_raw_fd(), libc::F_GETPIPE_SZ) };
                drop(read_end);
                drop(write_end);
                if cap > 0 {
                    cap as usize
                } else {
                    FALLBACK
                }
            }
            Err(_) => FALLBACK,
        }
    })
}

fn nix_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
