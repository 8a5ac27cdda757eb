//! Readiness multiplexing across sockets and pipes.
//!
//! Sticky readiness short-circuits the wait. With only sockets in the set
//! the native `poll(2)` does the waiting and every descriptor's result is
//! reported. Once a pipe is involved the wait is over heterogeneous
//! objects and only the first one to fire is translated; if that object
//! turns out to have nothing to report the call fails with `EINTR`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use crate::descriptors::Descriptors;
use crate::error::{Errno, Result, TransportError};
use crate::host::wait::{poll_native, wait_any, WaitOutcome, WaitSource};
use crate::host::Event;
use crate::pipe::Pipe;
use crate::ready::Ready;
use crate::registry::{Fd, Resource};
use crate::socket::Socket;

/// Upper bound (exclusive) on descriptors per call.
pub const MAX_POLL_FDS: usize = 64;

/// One entry of a `poll` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: Fd,
    pub events: Ready,
    pub revents: Ready,
}

impl PollFd {
    pub fn new(fd: Fd, events: Ready) -> Self {
        Self {
            fd,
            events,
            revents: Ready::empty(),
        }
    }
}

/// A read-interest descriptor set for [`Descriptors::select`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdSet {
    fds: Vec<Fd>,
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `fd`. Returns `false` if the set is full.
    pub fn insert(&mut self, fd: Fd) -> bool {
        if self.fds.contains(&fd) {
            return true;
        }
        if self.fds.len() + 1 >= MAX_POLL_FDS {
            return false;
        }
        self.fds.push(fd);
        true
    }

    pub fn remove(&mut self, fd: Fd) {
        self.fds.retain(|f| *f != fd);
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.fds.contains(&fd)
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Fd> + '_ {
        self.fds.iter().copied()
    }
}

enum Target {
    Socket(Arc<Socket>),
    Pipe(Arc<Pipe>, Option<Arc<Event>>),
}

impl Descriptors {
    /// Wait for readiness on `fds`. A negative timeout waits forever.
    ///
    /// Returns the number of entries with a non-empty `revents`; zero on
    /// timeout.
    pub fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> Result<usize> {
        if fds.is_empty() || fds.len() >= MAX_POLL_FDS {
            return Err(TransportError::os("poll", Errno::Inval));
        }

        let mut targets = Vec::with_capacity(fds.len());
        let mut ready = 0;
        let mut pipes = 0;
        for pfd in fds.iter_mut() {
            pfd.revents = Ready::empty();
            let interest = pfd.events.reportable();
            match self.registry().lookup(pfd.fd) {
                Some(Resource::Socket(sock)) => {
                    pfd.revents = sock.sticky() & interest;
                    targets.push(Target::Socket(sock));
                }
                Some(Resource::Pipe(pipe)) => {
                    let (sticky, event) = pipe.readiness();
                    pfd.revents = if event.is_none() {
                        Ready::NVAL
                    } else {
                        sticky & interest
                    };
                    pipes += 1;
                    targets.push(Target::Pipe(pipe, event));
                }
                None => {
                    error!(fd = %pfd.fd, "poll on unknown descriptor");
                    return Err(TransportError::BadHandle(pfd.fd));
                }
            }
            if !pfd.revents.is_empty() {
                ready += 1;
            }
        }
        if ready > 0 {
            trace!(ready, "poll satisfied by sticky readiness");
            return Ok(ready);
        }

        if pipes > 0 {
            self.wait_mixed(fds, &targets, timeout_ms)
        } else {
            Self::wait_sockets(fds, &targets, timeout_ms)
        }
    }

    /// [`poll`](Self::poll) with an optional duration; `None` waits forever.
    pub fn poll_timeout(&self, fds: &mut [PollFd], timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };
        self.poll(fds, timeout_ms)
    }

    /// Read-only `select`: on return `readfds` holds the ready subset.
    pub fn select(&self, readfds: &mut FdSet, timeout: Option<Duration>) -> Result<usize> {
        let mut fds: Vec<PollFd> = readfds.iter().map(|fd| PollFd::new(fd, Ready::IN)).collect();
        readfds.clear();
        let ready = self.poll_timeout(&mut fds, timeout)?;
        for pfd in fds.iter().filter(|p| !p.revents.is_empty()) {
            readfds.insert(pfd.fd);
        }
        Ok(ready)
    }

    fn wait_mixed(&self, fds: &mut [PollFd], targets: &[Target], timeout_ms: i32) -> Result<usize> {
        let sources: Vec<WaitSource> = fds
            .iter()
            .zip(targets)
            .map(|(pfd, target)| match target {
                Target::Socket(sock) => WaitSource {
                    fd: sock.raw_fd(),
                    interest: pfd.events,
                },
                Target::Pipe(_, event) => WaitSource {
                    fd: event.as_ref().map_or(-1, |ev| ev.wait_fd()),
                    interest: Ready::IN,
                },
            })
            .collect();

        let idx = match wait_any(&sources, timeout_ms) {
            Ok(WaitOutcome::Signaled(idx)) => idx,
            Ok(WaitOutcome::TimedOut) => return Ok(0),
            Err(e) => return Err(TransportError::from_io("poll", e)),
        };

        let interest = fds[idx].events.reportable();
        let revents = match &targets[idx] {
            Target::Socket(sock) => sock.network_events()? & interest,
            Target::Pipe(pipe, _) => pipe.complete_nowait() & interest,
        };
        if revents.is_empty() {
            trace!(fd = %fds[idx].fd, "wake without matching readiness");
            return Err(TransportError::os("poll", Errno::Intr));
        }
        fds[idx].revents = revents;
        Ok(1)
    }

    fn wait_sockets(fds: &mut [PollFd], targets: &[Target], timeout_ms: i32) -> Result<usize> {
        let mut native: Vec<libc::pollfd> = fds
            .iter()
            .zip(targets)
            .map(|(pfd, target)| libc::pollfd {
                fd: match target {
                    Target::Socket(sock) => sock.raw_fd(),
                    Target::Pipe(..) => -1,
                },
                events: pfd.events.to_poll_events(),
                revents: 0,
            })
            .collect();
        poll_native(&mut native, timeout_ms).map_err(|e| TransportError::from_io("poll", e))?;

        let mut ready = 0;
        for (pfd, raw) in fds.iter_mut().zip(&native) {
            pfd.revents = Ready::from_poll_events(raw.revents) & pfd.events.reportable();
            if !pfd.revents.is_empty() {
                ready += 1;
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Domain, SockAddr};
    use std::thread;

    fn pipe_pair(io: &Descriptors, name: &str) -> (Fd, Fd, Fd) {
        let lfd = io.socket(Domain::Local).unwrap();
        io.bind(lfd, &SockAddr::local(name).unwrap()).unwrap();
        io.listen(lfd, 8).unwrap();
        let cfd = io.socket(Domain::Local).unwrap();
        io.connect(cfd, &SockAddr::local(name).unwrap()).unwrap();
        let (sfd, _) = io.accept(lfd).unwrap();
        (lfd, sfd, cfd)
    }

    fn tcp_pair(io: &Descriptors) -> (Fd, Fd) {
        let lfd = io.socket(Domain::Inet).unwrap();
        io.bind(lfd, &SockAddr::Inet("127.0.0.1:0".parse().unwrap())).unwrap();
        io.listen(lfd, 8).unwrap();
        let addr = io.local_addr(lfd).unwrap();
        let cfd = io.socket(Domain::Inet).unwrap();
        io.connect(cfd, &addr).unwrap();
        let (sfd, _) = io.accept(lfd).unwrap();
        (sfd, cfd)
    }

    #[test]
    fn rejects_empty_and_oversized_sets() {
        let io = Descriptors::in_process();
        assert_eq!(io.poll(&mut [], 0).unwrap_err().errno(), Errno::Inval);
        let fd = io.socket(Domain::Local).unwrap();
        let mut many = vec![PollFd::new(fd, Ready::IN); MAX_POLL_FDS];
        assert_eq!(io.poll(&mut many, 0).unwrap_err().errno(), Errno::Inval);

        // The largest accepted set is one short of the bound.
        let tcp = io.socket(Domain::Inet).unwrap();
        let mut largest = vec![PollFd::new(tcp, Ready::IN); MAX_POLL_FDS - 1];
        assert!(io.poll(&mut largest, 0).is_ok());
    }

    #[test]
    fn unknown_descriptor_is_bad_handle() {
        let io = Descriptors::in_process();
        let mut fds = [PollFd::new(Fd::from_raw(99), Ready::IN)];
        assert!(matches!(io.poll(&mut fds, 0), Err(TransportError::BadHandle(_))));
    }

    #[test]
    fn sticky_readiness_returns_without_waiting() {
        let io = Descriptors::in_process();
        let (_, sfd, cfd) = pipe_pair(&io, "sticky");
        io.write(cfd, b"0123456789").unwrap();
        let mut small = [0u8; 4];
        io.read(sfd, &mut small).unwrap();

        // Six bytes remain buffered: readiness must be reported immediately
        // even with an infinite timeout.
        let mut fds = [PollFd::new(sfd, Ready::IN)];
        assert_eq!(io.poll(&mut fds, -1).unwrap(), 1);
        assert_eq!(fds[0].revents, Ready::IN);
    }

    #[test]
    fn pipe_wait_times_out_with_zero() {
        let io = Descriptors::in_process();
        let (_, sfd, _cfd) = pipe_pair(&io, "quiet");
        let mut fds = [PollFd::new(sfd, Ready::IN)];
        assert_eq!(io.poll(&mut fds, 20).unwrap(), 0);
        assert!(fds[0].revents.is_empty());
    }

    #[test]
    fn pipe_wakes_when_peer_writes() {
        let io = Descriptors::in_process();
        let (_, sfd, cfd) = pipe_pair(&io, "wake");
        let writer = io.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.write(cfd, b"x").unwrap();
        });
        let mut fds = [PollFd::new(sfd, Ready::IN)];
        assert_eq!(io.poll(&mut fds, 2000).unwrap(), 1);
        assert!(fds[0].revents.contains(Ready::IN));
        handle.join().unwrap();
    }

    #[test]
    fn listening_pipe_reports_pending_accept() {
        let io = Descriptors::in_process();
        let lfd = io.socket(Domain::Local).unwrap();
        io.bind(lfd, &SockAddr::local("acceptable").unwrap()).unwrap();
        io.listen(lfd, 8).unwrap();
        let cfd = io.socket(Domain::Local).unwrap();
        io.connect(cfd, &SockAddr::local("acceptable").unwrap()).unwrap();

        let mut fds = [PollFd::new(lfd, Ready::IN)];
        assert_eq!(io.poll(&mut fds, 1000).unwrap(), 1);
        assert!(io.accept(lfd).is_ok());
    }

    #[test]
    fn mixed_set_reports_only_first_fired() {
        let io = Descriptors::in_process();
        let (_, sfd, cfd) = pipe_pair(&io, "mixed");
        let (tsfd, tcfd) = tcp_pair(&io);
        io.write(tcfd, b"t").unwrap();
        io.write(cfd, b"p").unwrap();

        let mut fds = [PollFd::new(sfd, Ready::IN), PollFd::new(tsfd, Ready::IN)];
        // The pipe's completion is sticky only after it is collected, so the
        // first call goes through the heterogeneous wait.
        let n = io.poll(&mut fds, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds.iter().filter(|p| !p.revents.is_empty()).count(), 1);
    }

    #[test]
    fn socket_only_set_reports_every_ready_entry() {
        let io = Descriptors::in_process();
        let (a, a_peer) = tcp_pair(&io);
        let (b, b_peer) = tcp_pair(&io);
        io.write(a_peer, b"1").unwrap();
        io.write(b_peer, b"2").unwrap();
        thread::sleep(Duration::from_millis(20));

        let mut fds = [PollFd::new(a, Ready::IN), PollFd::new(b, Ready::IN)];
        assert_eq!(io.poll(&mut fds, 1000).unwrap(), 2);
    }

    #[test]
    fn unbound_pipe_is_invalid_for_waiting() {
        let io = Descriptors::in_process();
        let fd = io.socket(Domain::Local).unwrap();
        let mut fds = [PollFd::new(fd, Ready::IN)];
        assert_eq!(io.poll(&mut fds, -1).unwrap(), 1);
        assert_eq!(fds[0].revents, Ready::NVAL);
    }

    #[test]
    fn hangup_is_reported_without_being_requested() {
        let io = Descriptors::in_process();
        let (_, sfd, cfd) = pipe_pair(&io, "gone");
        io.close(cfd).unwrap();
        let mut fds = [PollFd::new(sfd, Ready::IN)];
        assert_eq!(io.poll(&mut fds, 1000).unwrap(), 1);
        assert!(fds[0].revents.contains(Ready::HUP));
    }

    #[test]
    fn select_keeps_only_ready_descriptors() {
        let io = Descriptors::in_process();
        let (_, busy, busy_peer) = pipe_pair(&io, "sel-busy");
        let (_, idle, _idle_peer) = pipe_pair(&io, "sel-idle");
        io.write(busy_peer, b"data").unwrap();
        let mut buf = [0u8; 1];
        io.read(busy, &mut buf).unwrap();

        let mut set = FdSet::new();
        set.insert(busy);
        set.insert(idle);
        assert_eq!(io.select(&mut set, Some(Duration::from_millis(50))).unwrap(), 1);
        assert!(set.contains(busy));
        assert!(!set.contains(idle));
    }
}
