use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use parking_lot::Mutex;

use super::wait::{wait_any, WaitOutcome, WaitSource};
use crate::ready::Ready;

/// Manual-reset event object.
///
/// Backed by a self-pipe so it can be waited on together with sockets in a
/// single `poll(2)` call. The read end is readable exactly while the event
/// is set.
#[derive(Debug)]
pub struct Event {
    read: OwnedFd,
    write: OwnedFd,
    signaled: Mutex<bool>,
}

impl Event {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe(2) succeeded, so both descriptors are open and owned
        // by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            set_cloexec_nonblock(fd)?;
        }
        Ok(Self {
            read,
            write,
            signaled: Mutex::new(false),
        })
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            let byte = 1u8;
            // SAFETY: writes one byte from a live stack variable to a pipe we own.
            unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
            *signaled = true;
        }
    }

    pub fn reset(&self) {
        let mut signaled = self.signaled.lock();
        if *signaled {
            let mut scratch = [0u8; 16];
            loop {
                // SAFETY: reads into a live stack buffer of the stated length.
                let n = unsafe {
                    libc::read(self.read.as_raw_fd(), scratch.as_mut_ptr().cast(), scratch.len())
                };
                if n <= 0 {
                    break;
                }
            }
            *signaled = false;
        }
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until the event is set. A negative timeout waits forever.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<bool> {
        let sources = [WaitSource {
            fd: self.wait_fd(),
            interest: Ready::IN,
        }];
        loop {
            match wait_any(&sources, timeout_ms) {
                Ok(WaitOutcome::Signaled(_)) => return Ok(true),
                Ok(WaitOutcome::TimedOut) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Descriptor that polls readable while the event is set.
    pub(crate) fn wait_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn set_cloexec_nonblock(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own, with integer arguments only.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_and_reset_are_idempotent() {
        let ev = Event::new().unwrap();
        assert!(!ev.is_set());
        ev.set();
        ev.set();
        assert!(ev.is_set());
        assert!(ev.wait(0).unwrap());
        ev.reset();
        ev.reset();
        assert!(!ev.is_set());
        assert!(!ev.wait(0).unwrap());
    }

    #[test]
    fn wait_wakes_on_set_from_other_thread() {
        let ev = Arc::new(Event::new().unwrap());
        let setter = Arc::clone(&ev);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(ev.wait(2000).unwrap());
        handle.join().unwrap();
    }
}
