use std::ffi::{CString, OsStr};
use std::io;
use std::path::Path;
use std::ptr;

use super::{cstring, cvt, retry_eintr};

/// Exit status as returned by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus(pub libc::c_int);

impl WaitStatus {
    pub fn exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    /// Exit code, if the child exited normally.
    pub fn code(self) -> Option<i32> {
        self.exited().then(|| libc::WEXITSTATUS(self.0))
    }

    /// Terminating signal, if the child was killed.
    pub fn signal(self) -> Option<i32> {
        libc::WIFSIGNALED(self.0).then(|| libc::WTERMSIG(self.0))
    }
}

pub fn waitpid(pid: libc::pid_t, options: libc::c_int) -> io::Result<(libc::pid_t, WaitStatus)> {
    let mut status: libc::c_int = 0;
    let pid = retry_eintr(|| cvt(unsafe { libc::waitpid(pid, &mut status, options) }))?;
    Ok((pid, WaitStatus(status)))
}

fn to_cstrings<S: AsRef<OsStr>>(items: &[S]) -> io::Result<Vec<CString>> {
    items.iter().map(|s| cstring(s.as_ref())).collect()
}

fn null_terminated(items: &[CString]) -> Vec<*const libc::c_char> {
    items
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Retries `exec` until it fails with something other than `EINTR`.
fn exec_loop(mut exec: impl FnMut() -> libc::c_int) -> io::Error {
    match retry_eintr(|| cvt(exec())) {
        Ok(_) => io::Error::new(io::ErrorKind::Other, "exec returned without an error"),
        Err(e) => e,
    }
}

/// Replaces the process image. Only returns on failure.
pub fn execve<A, E>(path: &Path, argv: &[A], envp: &[E]) -> io::Error
where
    A: AsRef<OsStr>,
    E: AsRef<OsStr>,
{
    let prepared = cstring(path.as_os_str())
        .and_then(|p| Ok((p, to_cstrings(argv)?, to_cstrings(envp)?)));
    let (path, argv, envp) = match prepared {
        Ok(v) => v,
        Err(e) => return e,
    };
    let argv_ptrs = null_terminated(&argv);
    let envp_ptrs = null_terminated(&envp);
    exec_loop(|| unsafe { libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) })
}

/// Like [`execve`] with the current environment.
pub fn execv<A: AsRef<OsStr>>(path: &Path, argv: &[A]) -> io::Error {
    let prepared = cstring(path.as_os_str()).and_then(|p| Ok((p, to_cstrings(argv)?)));
    let (path, argv) = match prepared {
        Ok(v) => v,
        Err(e) => return e,
    };
    let argv_ptrs = null_terminated(&argv);
    exec_loop(|| unsafe { libc::execv(path.as_ptr(), argv_ptrs.as_ptr()) })
}

/// Like [`execv`] but searches `PATH` for `file`.
pub fn execvp<A: AsRef<OsStr>>(file: &OsStr, argv: &[A]) -> io::Error {
    let prepared = cstring(file).and_then(|f| Ok((f, to_cstrings(argv)?)));
    let (file, argv) = match prepared {
        Ok(v) => v,
        Err(e) => return e,
    };
    let argv_ptrs = null_terminated(&argv);
    exec_loop(|| unsafe { libc::execvp(file.as_ptr(), argv_ptrs.as_ptr()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_waitpid_reaps_child() {
        let child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let (pid, status) = waitpid(child.id() as libc::pid_t, 0).unwrap();
        assert_eq!(pid, child.id() as libc::pid_t);
        assert!(status.exited());
        assert_eq!(status.code(), Some(7));
        assert_eq!(status.signal(), None);
    }

    #[test]
    fn test_execve_missing_binary_returns_error() {
        let err = execve(
            Path::new("/nonexistent/binary"),
            &["binary"],
            &[] as &[&str],
        );
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_execvp_rejects_interior_nul() {
        let err = execvp(OsStr::new("bad\0name"), &["x"]);
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
