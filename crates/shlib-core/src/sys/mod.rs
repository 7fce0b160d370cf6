//! EINTR-safe wrappers around the POSIX calls used by the loader.
//!
//! Every wrapper retries transparently when the call is interrupted by a
//! signal and hands any other OS error back unchanged. Descriptors created
//! here are close-on-exec, atomically where the platform has a flag or a
//! dedicated syscall for it, otherwise via `fcntl` right after creation (a
//! concurrent `fork`+`exec` in another thread can still leak the descriptor
//! in that window).

use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

mod process;
mod select;
mod signal;

pub use process::{execv, execve, execvp, waitpid, WaitStatus};
pub use select::{retry_with_deadline, select, FdSet, MonotonicClock, SystemClock};
pub use signal::{ignore_sigpipe, write_nosignal};

/// Return values that signal failure with `-1`.
pub trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

macro_rules! impl_is_minus_one {
    ($($t:ident)*) => ($(impl IsMinusOne for $t {
        fn is_minus_one(&self) -> bool {
            *self == -1
        }
    })*)
}

impl_is_minus_one! { i32 i64 isize }

/// Converts a raw syscall return into `io::Result`, reading `errno` on `-1`.
pub fn cvt<T: IsMinusOne>(t: T) -> io::Result<T> {
    if t.is_minus_one() {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

/// Calls `f` until it returns something other than an `Interrupted` error.
pub fn retry_eintr<T, F>(mut f: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub(crate) fn cstring(s: &OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "path or argument contains an interior NUL byte",
        )
    })
}

/// Opens `path` with `flags | O_CLOEXEC`.
pub fn open(path: &Path, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    let c_path = cstring(path.as_os_str())?;
    let fd = retry_eintr(|| {
        cvt(unsafe {
            libc::open(
                c_path.as_ptr(),
                flags | libc::O_CLOEXEC,
                libc::c_uint::from(mode),
            )
        })
    })?;
    // SAFETY: `fd` was just returned by a successful open and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let n = retry_eintr(|| {
        cvt(unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) })
    })?;
    Ok(n as usize)
}

pub fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    let n = retry_eintr(|| {
        cvt(unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) })
    })?;
    Ok(n as usize)
}

/// Closes `fd`.
///
/// `EINTR` is reported as success: the descriptor has already been released
/// by the kernel at that point and retrying could close a number that another
/// thread has since been given.
pub fn close(fd: OwnedFd) -> io::Result<()> {
    let raw = fd.into_raw_fd();
    match cvt(unsafe { libc::close(raw) }) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sets `FD_CLOEXEC` on an existing descriptor.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = retry_eintr(|| cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) }))?;
    if flags & libc::FD_CLOEXEC != 0 {
        return Ok(());
    }
    retry_eintr(|| cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) }))?;
    Ok(())
}

/// Duplicates `fd` onto the lowest free descriptor, close-on-exec.
pub fn dup(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let new = retry_eintr(|| {
        cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) })
    })?;
    // SAFETY: fresh descriptor from F_DUPFD_CLOEXEC.
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Duplicates `old` onto `new`, closing whatever `new` referred to.
///
/// The result is close-on-exec. The caller keeps ownership of `new`.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn dup2(old: BorrowedFd<'_>, new: RawFd) -> io::Result<RawFd> {
    retry_eintr(|| cvt(unsafe { libc::dup3(old.as_raw_fd(), new, libc::O_CLOEXEC) }))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub fn dup2(old: BorrowedFd<'_>, new: RawFd) -> io::Result<RawFd> {
    let fd = retry_eintr(|| cvt(unsafe { libc::dup2(old.as_raw_fd(), new) }))?;
    set_cloexec(fd)?;
    Ok(fd)
}

/// Creates a pipe; returns `(read_end, write_end)`, both close-on-exec.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    retry_eintr(|| cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }))?;
    // SAFETY: pipe2 succeeded, both descriptors are new.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    retry_eintr(|| cvt(unsafe { libc::pipe(fds.as_mut_ptr()) }))?;
    // SAFETY: pipe succeeded, both descriptors are new.
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(r.as_raw_fd())?;
    set_cloexec(w.as_raw_fd())?;
    Ok((r, w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags != -1 && flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn test_retry_eintr_hides_interruptions() {
        let mut remaining = 5;
        let result = retry_eintr(|| {
            if remaining > 0 {
                remaining -= 1;
                Err(io::Error::from_raw_os_error(libc::EINTR))
            } else {
                Ok(42usize)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_retry_eintr_propagates_other_errors() {
        let mut calls = 0;
        let result: io::Result<()> = retry_eintr(|| {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::EBADF))
        });
        assert_eq!(result.unwrap_err().raw_os_error(), Some(libc::EBADF));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_pipe_is_cloexec_and_round_trips() {
        let (r, w) = pipe().unwrap();
        assert!(is_cloexec(r.as_raw_fd()));
        assert!(is_cloexec(w.as_raw_fd()));

        assert_eq!(write(w.as_fd(), b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = read(r.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        close(w).unwrap();
        assert_eq!(read(r.as_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_dup_sets_cloexec() {
        let (r, _w) = pipe().unwrap();
        let copy = dup(r.as_fd()).unwrap();
        assert_ne!(copy.as_raw_fd(), r.as_raw_fd());
        assert!(is_cloexec(copy.as_raw_fd()));
    }

    #[test]
    fn test_dup2_onto_existing_descriptor() {
        let (r1, _w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();
        let target = r1.as_raw_fd();
        assert_eq!(dup2(r2.as_fd(), target).unwrap(), target);
        assert!(is_cloexec(target));

        write(w2.as_fd(), b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read(r1.as_fd(), &mut buf).unwrap(), 1);
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_open_missing_file_reports_enoent() {
        let err = open(Path::new("/definitely/not/here"), libc::O_RDONLY, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_open_sets_cloexec() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = open(file.path(), libc::O_RDONLY, 0).unwrap();
        assert!(is_cloexec(fd.as_raw_fd()));
    }

    #[test]
    fn test_interior_nul_is_invalid_input() {
        let err = cstring(OsStr::new("a\0b")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
