//! `AF_LOCAL` stream descriptors emulated on message-mode named pipes.
//!
//! A listening pipe keeps one overlapped accept in flight. When it
//! completes, the connected instance moves to a new descriptor and a fresh
//! instance takes over the listening descriptor. A connected pipe keeps one
//! overlapped read in flight into its private buffer; readiness is tracked
//! in sticky bits updated whenever that read completes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::addr::{LocalAddr, SockAddr};
use crate::error::{Errno, Result, TransportError};
use crate::host::{
    Completion, Event, NativePipe, OpenError, PipeHost, WriteFault, PIPE_BUSY_WAIT, PIPE_RECVBUF,
    PIPE_SENDBUF,
};
use crate::ready::Ready;
use crate::registry::{Fd, Registry, Resource};
use crate::socket::{SockOpt, SOCK_STREAM};

/// Pipe emulator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeConfig {
    /// How long `connect` waits for a busy pipe before giving up.
    pub busy_wait: Duration,
    /// Size of each pipe's read buffer.
    pub read_buffer: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            busy_wait: PIPE_BUSY_WAIT,
            read_buffer: PIPE_RECVBUF,
        }
    }
}

/// Credentials of the process on the other end of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: Option<u32>,
}

/// A pipe-backed descriptor.
pub struct Pipe {
    state: Mutex<PipeState>,
}

struct PipeState {
    addr: Option<LocalAddr>,
    native: Option<Box<dyn NativePipe>>,
    event: Option<Arc<Event>>,
    listening: bool,
    /// Listener whose instance could not be recreated after an accept.
    relisten: bool,
    blocking: bool,
    read_pending: bool,
    rd_count: usize,
    rd_pos: usize,
    rd_events: Ready,
    terminal_reported: bool,
    rd_buffer: Box<[u8]>,
    rearms: u64,
}

impl Pipe {
    /// A fresh, unbound, blocking pipe descriptor.
    pub fn unbound() -> Self {
        Self::with_state(None, true, PIPE_RECVBUF)
    }

    fn with_state(addr: Option<LocalAddr>, blocking: bool, read_buffer: usize) -> Self {
        Self {
            state: Mutex::new(PipeState {
                addr,
                native: None,
                event: None,
                listening: false,
                relisten: false,
                blocking,
                read_pending: false,
                rd_count: 0,
                rd_pos: 0,
                rd_events: Ready::empty(),
                terminal_reported: false,
                rd_buffer: vec![0u8; read_buffer].into_boxed_slice(),
                rearms: 0,
            }),
        }
    }

    /// Sticky readiness and the completion event, if any.
    pub(crate) fn readiness(&self) -> (Ready, Option<Arc<Event>>) {
        let st = self.state.lock();
        (st.rd_events, st.event.clone())
    }

    /// Collect a finished overlapped operation without blocking.
    pub(crate) fn complete_nowait(&self) -> Ready {
        let mut st = self.state.lock();
        if st.read_pending {
            st.complete(false);
        }
        st.rd_events
    }

    /// Number of reads started since the descriptor was connected.
    pub fn rearm_count(&self) -> u64 {
        self.state.lock().rearms
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Pipe")
            .field("addr", &st.addr)
            .field("phase", &st.phase())
            .field("rd_events", &st.rd_events)
            .finish()
    }
}

impl PipeState {
    fn phase(&self) -> &'static str {
        match (&self.native, self.listening, &self.addr) {
            (Some(_), true, _) => "listening",
            (None, _, Some(_)) if self.relisten => "listening",
            (Some(_), false, _) => "connected",
            (None, _, Some(_)) => "bound",
            (None, _, None) => "unbound",
        }
    }

    fn connected(&self) -> bool {
        self.native.is_some() && !self.listening
    }

    fn new_event() -> Result<Arc<Event>> {
        Event::new()
            .map(Arc::new)
            .map_err(|e| TransportError::from_io("pipe event", e))
    }

    /// Create a server instance and start an overlapped accept on it.
    fn start_listening(&mut self, host: &dyn PipeHost) -> Result<()> {
        let Some(addr) = self.addr.clone() else {
            return Err(TransportError::os("listen", Errno::Inval));
        };
        let mut native = host.create_instance(&addr.pipe_name()).map_err(|code| {
            warn!(pipe = %addr, code, "could not create pipe instance");
            // Name clashes keep their meaning; anything else reads as host exhaustion.
            let errno = Errno::from_raw_os_error(code)
                .filter(|e| matches!(e, Errno::AddrInUse | Errno::Acces | Errno::NameTooLong))
                .unwrap_or(Errno::NFile);
            TransportError::os("listen", errno)
        })?;
        let event = Self::new_event()?;
        match native.start_accept(&event) {
            Completion::Pending => {
                self.read_pending = true;
                self.rd_events = Ready::empty();
            }
            Completion::Connected | Completion::Done(_) => {
                event.set();
                self.read_pending = false;
                self.rd_events = Ready::IN;
            }
            other => {
                warn!(pipe = %addr, ?other, "accept could not be started");
                return Err(TransportError::os("listen", Errno::Io));
            }
        }
        self.native = Some(native);
        self.event = Some(event);
        self.listening = true;
        self.relisten = false;
        Ok(())
    }

    /// Start the next overlapped read into the private buffer.
    fn arm_read(&mut self) {
        debug_assert!(!self.listening && !self.read_pending);
        let (Some(native), Some(event)) = (self.native.as_mut(), self.event.as_ref()) else {
            self.rd_events = Ready::ERR;
            return;
        };
        self.rearms += 1;
        self.rd_count = 0;
        self.rd_pos = 0;
        let outcome = native.start_read(&mut self.rd_buffer, event);
        if outcome == Completion::Pending {
            self.read_pending = true;
            self.rd_events = Ready::empty();
            return;
        }
        event.set();
        self.apply_read(outcome);
    }

    fn apply_read(&mut self, outcome: Completion) {
        self.read_pending = false;
        self.rd_events = match outcome {
            Completion::Done(0) | Completion::Closed => Ready::HUP,
            Completion::Done(n) | Completion::MoreData(n) => {
                self.rd_count = n;
                self.rd_pos = 0;
                Ready::IN
            }
            Completion::Pending => {
                self.read_pending = true;
                Ready::empty()
            }
            Completion::Connected | Completion::Failed(_) => Ready::ERR,
        };
    }

    /// Collect the outstanding operation. Returns `false` if it is still
    /// in flight.
    fn complete(&mut self, wait: bool) -> bool {
        debug_assert!(self.read_pending);
        let Some(native) = self.native.as_mut() else {
            self.read_pending = false;
            self.rd_events = Ready::ERR;
            return true;
        };
        let outcome = native.overlapped_result(&mut self.rd_buffer, wait);
        if outcome == Completion::Pending {
            return false;
        }
        if self.listening {
            self.read_pending = false;
            self.rd_events = match outcome {
                Completion::Done(_) | Completion::Connected => Ready::IN,
                Completion::Closed => Ready::HUP,
                _ => Ready::ERR,
            };
        } else {
            self.apply_read(outcome);
        }
        true
    }

    /// Report a terminal condition once, then end-of-stream.
    fn terminal(&mut self, errno: Errno) -> Result<usize> {
        if self.terminal_reported {
            return Ok(0);
        }
        self.terminal_reported = true;
        Err(TransportError::os("read", errno))
    }

    fn shutdown(&mut self) {
        self.native = None;
        self.event = None;
        self.listening = false;
        self.read_pending = false;
        self.rd_events = Ready::empty();
    }
}

/// Verbs on pipe-backed descriptors.
#[derive(Clone)]
pub struct PipeEmulator {
    registry: Arc<Registry>,
    host: Arc<dyn PipeHost>,
    config: PipeConfig,
}

impl std::fmt::Debug for PipeEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEmulator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipeEmulator {
    pub fn new(registry: Arc<Registry>, host: Arc<dyn PipeHost>, config: PipeConfig) -> Self {
        Self {
            registry,
            host,
            config,
        }
    }

    fn pipe(&self, fd: Fd) -> Result<Arc<Pipe>> {
        self.registry
            .lookup_pipe(fd)
            .ok_or(TransportError::BadHandle(fd))
    }

    /// Allocate an unbound pipe descriptor.
    pub fn open(&self) -> Result<Fd> {
        let pipe = Pipe::with_state(None, true, self.config.read_buffer);
        let fd = self.registry.assign(Resource::Pipe(Arc::new(pipe)))?;
        debug!(%fd, "pipe descriptor created");
        Ok(fd)
    }

    pub fn bind(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        let pipe = self.pipe(fd)?;
        let mut st = pipe.state.lock();
        if st.native.is_some() {
            return Err(TransportError::os("bind", Errno::IsConn));
        }
        if st.addr.is_some() {
            return Err(TransportError::os("bind", Errno::Inval));
        }
        let local = addr
            .as_local()
            .ok_or_else(|| TransportError::os("bind", Errno::Inval))?;
        st.addr = Some(local.clone());
        debug!(%fd, pipe = %local, "pipe bound");
        Ok(())
    }

    pub fn listen(&self, fd: Fd) -> Result<()> {
        let pipe = self.pipe(fd)?;
        let mut st = pipe.state.lock();
        if st.native.is_some() {
            return Err(TransportError::os("listen", Errno::IsConn));
        }
        if st.addr.is_none() {
            return Err(TransportError::os("listen", Errno::Inval));
        }
        st.start_listening(self.host.as_ref())?;
        debug!(%fd, "pipe listening");
        Ok(())
    }

    /// Hand out the connected instance on a new descriptor.
    ///
    /// On a full table the connected client is dropped, the listening
    /// descriptor goes back to waiting for a client and the exhaustion is
    /// reported to the caller.
    ///
    /// If the host refuses the replacement instance the connection is still
    /// handed out. The next accept retries the instance and fails with `EIO`
    /// while the host keeps refusing.
    pub fn accept(&self, fd: Fd) -> Result<(Fd, SockAddr)> {
        let pipe = self.pipe(fd)?;
        let mut st = pipe.state.lock();
        if st.native.is_none() && st.relisten {
            if let Err(e) = st.start_listening(self.host.as_ref()) {
                warn!(%fd, error = %e, "pipe listener still cannot be recreated");
                return Err(TransportError::os("accept", Errno::Io));
            }
            debug!(%fd, "pipe listener recreated");
        }
        if st.native.is_none() {
            return Err(TransportError::os("accept", Errno::NotConn));
        }
        if !st.listening {
            return Err(TransportError::WrongState {
                op: "accept",
                state: st.phase(),
            });
        }
        if st.read_pending {
            let wait = st.blocking;
            if !st.complete(wait) {
                return Err(TransportError::os("accept", Errno::Again));
            }
        }
        if !st.rd_events.contains(Ready::IN) {
            return Err(TransportError::os("accept", Errno::Io));
        }

        let addr = st.addr.clone();
        let fresh = Arc::new(Pipe::with_state(
            addr.clone(),
            st.blocking,
            self.config.read_buffer,
        ));
        match self.registry.split(fd, &pipe, Arc::clone(&fresh)) {
            Ok(new_fd) => {
                st.listening = false;
                st.arm_read();
                drop(st);
                let mut next = fresh.state.lock();
                if let Err(e) = next.start_listening(self.host.as_ref()) {
                    warn!(%fd, error = %e, "replacement listener could not start, retrying on next accept");
                    next.relisten = true;
                }
                drop(next);
                debug!(listening = %fd, connected = %new_fd, "pipe connection accepted");
                let peer = addr
                    .map(SockAddr::Local)
                    .ok_or_else(|| TransportError::os("accept", Errno::Inval))?;
                Ok((new_fd, peer))
            }
            Err(e) => {
                warn!(%fd, error = %e, "no descriptor for accepted pipe, dropping client");
                st.shutdown();
                st.start_listening(self.host.as_ref())?;
                Err(e)
            }
        }
    }

    pub fn connect(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        let pipe = self.pipe(fd)?;
        let mut st = pipe.state.lock();
        if st.native.is_some() {
            return Err(TransportError::os("connect", Errno::IsConn));
        }
        if st.addr.is_some() {
            return Err(TransportError::os("connect", Errno::Inval));
        }
        let local = addr
            .as_local()
            .ok_or_else(|| TransportError::os("connect", Errno::Inval))?;
        let name = local.pipe_name();
        let native = loop {
            match self.host.open(&name) {
                Ok(native) => break native,
                Err(OpenError::Busy) => {
                    if !self.host.wait_available(&name, self.config.busy_wait) {
                        return Err(TransportError::os("connect", Errno::ConnRefused));
                    }
                }
                Err(OpenError::AccessDenied) => {
                    return Err(TransportError::os("connect", Errno::Acces))
                }
                Err(OpenError::NotFound) => {
                    return Err(TransportError::os("connect", Errno::NoEnt))
                }
                Err(OpenError::Other(code)) => {
                    debug!(pipe = %local, code, "pipe open failed");
                    return Err(TransportError::os("connect", Errno::ConnRefused));
                }
            }
        };
        let event = PipeState::new_event()
            .map_err(|_| TransportError::os("connect", Errno::ConnRefused))?;
        st.native = Some(native);
        st.event = Some(event);
        st.addr = Some(local.clone());
        st.terminal_reported = false;
        st.arm_read();
        debug!(%fd, pipe = %local, "pipe connected");
        Ok(())
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let pipe = self.pipe(fd)?;
        let mut st = pipe.state.lock();
        if !st.connected() {
            return Err(TransportError::os("read", Errno::NotConn));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if st.read_pending {
            let wait = st.blocking;
            if !st.complete(wait) {
                return Err(TransportError::os("read", Errno::Again));
            }
        }
        if st.rd_events.contains(Ready::IN) {
            let mut total = 0;
            while total < buf.len() && st.rd_events.contains(Ready::IN) {
                let avail = st.rd_count - st.rd_pos;
                let n = avail.min(buf.len() - total);
                let start = st.rd_pos;
                buf[total..total + n].copy_from_slice(&st.rd_buffer[start..start + n]);
                st.rd_pos += n;
                total += n;
                if st.rd_pos == st.rd_count {
                    st.arm_read();
                }
            }
            return Ok(total);
        }
        if st.rd_events.contains(Ready::HUP) {
            return st.terminal(Errno::Pipe);
        }
        if st.rd_events.contains(Ready::ERR) {
            return st.terminal(Errno::Io);
        }
        Err(TransportError::os("read", Errno::Again))
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let pipe = self.pipe(fd)?;
        let mut st = pipe.state.lock();
        if !st.connected() {
            return Err(TransportError::os("write", Errno::NotConn));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(native) = st.native.as_mut() else {
            return Err(TransportError::os("write", Errno::NotConn));
        };
        native.write(buf).map_err(|fault| {
            let errno = match fault {
                WriteFault::Broken => Errno::Pipe,
                WriteFault::Pending => Errno::Again,
                WriteFault::Other(_) => Errno::Io,
            };
            TransportError::os("write", errno)
        })
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        let pipe = self.pipe(fd)?;
        if !self.registry.release(fd, &Resource::Pipe(Arc::clone(&pipe))) {
            return Err(TransportError::BadHandle(fd));
        }
        pipe.state.lock().shutdown();
        debug!(%fd, "pipe closed");
        Ok(())
    }

    pub fn set_nonblocking(&self, fd: Fd, nonblocking: bool) -> Result<()> {
        let pipe = self.pipe(fd)?;
        pipe.state.lock().blocking = !nonblocking;
        Ok(())
    }

    pub fn local_addr(&self, fd: Fd) -> Result<SockAddr> {
        let pipe = self.pipe(fd)?;
        let st = pipe.state.lock();
        st.addr
            .clone()
            .map(SockAddr::Local)
            .ok_or_else(|| TransportError::os("getsockname", Errno::Inval))
    }

    pub fn peer_addr(&self, fd: Fd) -> Result<SockAddr> {
        let pipe = self.pipe(fd)?;
        let st = pipe.state.lock();
        if !st.connected() {
            return Err(TransportError::os("getpeername", Errno::NotConn));
        }
        st.addr
            .clone()
            .map(SockAddr::Local)
            .ok_or_else(|| TransportError::os("getpeername", Errno::NotConn))
    }

    pub fn get_opt(&self, fd: Fd, opt: SockOpt) -> Result<i32> {
        let pipe = self.pipe(fd)?;
        let st = pipe.state.lock();
        match opt {
            SockOpt::Type => Ok(SOCK_STREAM),
            SockOpt::RecvBuf => Ok(st.rd_buffer.len() as i32),
            SockOpt::SendBuf => Ok(PIPE_SENDBUF as i32),
            SockOpt::NoDelay | SockOpt::ReuseAddr => {
                Err(TransportError::os("getsockopt", Errno::Inval))
            }
        }
    }

    /// Options are accepted and ignored; pipe buffers are fixed.
    pub fn set_opt(&self, fd: Fd, opt: SockOpt, _value: i32) -> Result<()> {
        self.pipe(fd)?;
        if opt == SockOpt::Type {
            return Err(TransportError::os("setsockopt", Errno::Inval));
        }
        Ok(())
    }

    pub fn peer_credentials(&self, fd: Fd) -> Result<PeerCredentials> {
        let pipe = self.pipe(fd)?;
        let st = pipe.state.lock();
        if !st.connected() {
            return Err(TransportError::os("getsockopt", Errno::NotConn));
        }
        let pid = st.native.as_ref().and_then(|n| n.client_process_id());
        Ok(PeerCredentials { pid })
    }
}
