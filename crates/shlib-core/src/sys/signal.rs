use std::io;
use std::mem::MaybeUninit;
use std::os::fd::BorrowedFd;
use std::ptr;
use std::sync::Once;

static IGNORE_SIGPIPE: Once = Once::new();

/// Ignores `SIGPIPE` for the whole process, once.
///
/// An application that installed its own handler keeps it; only the default
/// disposition is replaced. Concurrent first callers block until the first
/// one finishes, so all of them observe the same end state.
pub fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        let mut current = MaybeUninit::<libc::sigaction>::zeroed();
        if libc::sigaction(libc::SIGPIPE, ptr::null(), current.as_mut_ptr()) != 0 {
            return;
        }
        let current = current.assume_init();
        if current.sa_sigaction != libc::SIG_DFL {
            return;
        }
        let mut ignore = current;
        ignore.sa_sigaction = libc::SIG_IGN;
        libc::sigaction(libc::SIGPIPE, &ignore, ptr::null_mut());
    });
}

/// Writes without letting a closed peer raise `SIGPIPE`; `EPIPE` is returned instead.
pub fn write_nosignal(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    ignore_sigpipe();
    super::write(fd, buf)
}
