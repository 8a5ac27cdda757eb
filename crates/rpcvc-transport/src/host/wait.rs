use std::io;
use std::os::fd::RawFd;

use crate::ready::Ready;

/// One waitable object handed to [`wait_any`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitSource {
    pub fd: RawFd,
    pub interest: Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Index of the lowest-numbered source that fired.
    Signaled(usize),
    TimedOut,
}

/// Wait until any source fires. A negative timeout waits forever.
pub(crate) fn wait_any(sources: &[WaitSource], timeout_ms: i32) -> io::Result<WaitOutcome> {
    let mut fds: Vec<libc::pollfd> = sources
        .iter()
        .map(|s| libc::pollfd {
            fd: s.fd,
            events: s.interest.to_poll_events(),
            revents: 0,
        })
        .collect();
    let ready = poll_native(&mut fds, timeout_ms)?;
    if ready == 0 {
        return Ok(WaitOutcome::TimedOut);
    }
    Ok(fds
        .iter()
        .position(|p| p.revents != 0)
        .map_or(WaitOutcome::TimedOut, WaitOutcome::Signaled))
}

/// Thin wrapper over `poll(2)`.
pub(crate) fn poll_native(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd structs
    // and its length is passed alongside the pointer.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Zero-timeout readiness check of a single descriptor.
pub(crate) fn peek_ready(fd: RawFd, interest: Ready) -> io::Result<Ready> {
    let mut fds = [libc::pollfd {
        fd,
        events: interest.to_poll_events(),
        revents: 0,
    }];
    poll_native(&mut fds, 0)?;
    Ok(Ready::from_poll_events(fds[0].revents))
}
