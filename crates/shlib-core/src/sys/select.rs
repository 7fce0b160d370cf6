//! Timed `select` that survives signal interruptions.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

use super::{cvt, retry_eintr};

/// A clock that never goes backwards under normal operation.
///
/// `now` is measured from an arbitrary, fixed origin.
pub trait MonotonicClock {
    fn now(&self) -> Duration;
}

/// `Instant`-backed clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Runs `attempt` with the time left until `timeout`, retrying on `EINTR`.
///
/// After each interruption the remaining time is recomputed against the
/// start time captured before the first attempt. Once nothing is left, or the
/// clock reports a time before the start, the wait counts as timed out and
/// `Ok(0)` is returned.
pub fn retry_with_deadline<C, F>(clock: &C, timeout: Duration, mut attempt: F) -> io::Result<usize>
where
    C: MonotonicClock + ?Sized,
    F: FnMut(Duration) -> io::Result<usize>,
{
    let start = clock.now();
    let mut remaining = timeout;
    loop {
        match attempt(remaining) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                let left = clock
                    .now()
                    .checked_sub(start)
                    .and_then(|elapsed| timeout.checked_sub(elapsed));
                match left {
                    Some(left) if !left.is_zero() => remaining = left,
                    _ => return Ok(0),
                }
            }
            other => return other,
        }
    }
}

/// Safe wrapper around `libc::fd_set`.
#[derive(Clone, Copy)]
pub struct FdSet(libc::fd_set);

impl FdSet {
    pub fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        // SAFETY: FD_ZERO fully initialises the set.
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            Self(raw.assume_init())
        }
    }

    fn check(fd: RawFd) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    pub fn insert(&mut self, fd: RawFd) -> io::Result<()> {
        Self::check(fd)?;
        unsafe { libc::FD_SET(fd, &mut self.0) };
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) {
        if Self::check(fd).is_ok() {
            unsafe { libc::FD_CLR(fd, &mut self.0) };
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        Self::check(fd).is_ok() && unsafe { libc::FD_ISSET(fd, &self.0) }
    }

    pub fn clear(&mut self) {
        unsafe { libc::FD_ZERO(&mut self.0) };
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdSet").finish_non_exhaustive()
    }
}

fn set_ptr(set: &mut Option<&mut FdSet>) -> *mut libc::fd_set {
    match set {
        Some(s) => &mut s.0,
        None => ptr::null_mut(),
    }
}

fn to_timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

/// `select(2)` with a monotonic, interruption-proof timeout.
///
/// `None` blocks until a descriptor is ready. The sets are restored to their
/// original contents before every retry. Returns the number of ready
/// descriptors, `0` on timeout.
pub fn select(
    nfds: RawFd,
    mut read: Option<&mut FdSet>,
    mut write: Option<&mut FdSet>,
    mut except: Option<&mut FdSet>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let saved = (
        read.as_deref().copied(),
        write.as_deref().copied(),
        except.as_deref().copied(),
    );

    let mut attempt = |remaining: Option<Duration>| -> io::Result<usize> {
        if let (Some(set), Some(orig)) = (read.as_deref_mut(), saved.0) {
            *set = orig;
        }
        if let (Some(set), Some(orig)) = (write.as_deref_mut(), saved.1) {
            *set = orig;
        }
        if let (Some(set), Some(orig)) = (except.as_deref_mut(), saved.2) {
            *set = orig;
        }
        let mut tv = remaining.map(to_timeval);
        let tv_ptr = match tv.as_mut() {
            Some(tv) => tv as *mut libc::timeval,
            None => ptr::null_mut(),
        };
        let n = cvt(unsafe {
            libc::select(
                nfds,
                set_ptr(&mut read),
                set_ptr(&mut write),
                set_ptr(&mut except),
                tv_ptr,
            )
        })?;
        Ok(n as usize)
    };

    match timeout {
        None => retry_eintr(|| attempt(None)),
        Some(timeout) => retry_with_deadline(&SystemClock::new(), timeout, |left| attempt(Some(left))),
    }
}
