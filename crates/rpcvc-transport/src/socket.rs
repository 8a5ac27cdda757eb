//! Socket adapter: stream sockets registered in the descriptor table.

use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use socket2::{Protocol, Type};
use tracing::{debug, trace};

use crate::addr::{Domain, SockAddr};
use crate::error::{Errno, Result, TransportError};
use crate::host::wait::peek_ready;
use crate::ready::Ready;
use crate::registry::{Fd, Registry, Resource};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Events a registered socket reports through the multiplexer.
const INTEREST: Ready = Ready::IN.union(Ready::PRI).union(Ready::OUT);

/// Integer socket options understood by both descriptor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// `SO_TYPE`, read-only.
    Type,
    /// `TCP_NODELAY`
    NoDelay,
    /// `SO_RCVBUF`
    RecvBuf,
    /// `SO_SNDBUF`
    SendBuf,
    /// `SO_REUSEADDR`
    ReuseAddr,
}

/// `SO_TYPE` value for stream descriptors.
pub const SOCK_STREAM: i32 = libc::SOCK_STREAM;

/// A registered native socket with its sticky readiness bits.
///
/// Once the slot is released the socket stops reporting readiness, even
/// while a poll still holds a reference to it.
#[derive(Debug)]
pub struct Socket {
    native: socket2::Socket,
    torn_down: AtomicBool,
    sticky: AtomicU16,
}

impl Socket {
    fn new(native: socket2::Socket) -> Self {
        Self {
            native,
            torn_down: AtomicBool::new(false),
            sticky: AtomicU16::new(0),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.native.as_raw_fd()
    }

    /// Whether the socket still reports network events.
    pub fn is_live(&self) -> bool {
        !self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn teardown(&self) {
        self.torn_down.store(true, Ordering::Release);
    }

    pub(crate) fn sticky(&self) -> Ready {
        Ready::from_bits_truncate(self.sticky.load(Ordering::Acquire))
    }

    pub(crate) fn latch(&self, ready: Ready) {
        self.sticky.fetch_or(ready.bits(), Ordering::AcqRel);
    }

    fn clear(&self, ready: Ready) {
        self.sticky.fetch_and(!ready.bits(), Ordering::AcqRel);
    }

    /// Enumerate pending network events and latch them.
    pub(crate) fn network_events(&self) -> Result<Ready> {
        if !self.is_live() {
            return Ok(Ready::NVAL);
        }
        let ready =
            peek_ready(self.raw_fd(), INTEREST).map_err(|e| TransportError::from_io("poll", e))?;
        self.latch(ready & (Ready::IN | Ready::PRI | Ready::OUT | Ready::HUP | Ready::ERR));
        Ok(ready)
    }
}

/// Verbs on registered native sockets.
#[derive(Debug, Clone)]
pub struct SocketAdapter {
    registry: Arc<Registry>,
}

impl SocketAdapter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    fn socket(&self, fd: Fd) -> Result<Arc<Socket>> {
        self.registry
            .lookup_socket(fd)
            .ok_or(TransportError::BadHandle(fd))
    }

    /// Create a stream socket in `domain`.
    pub fn open(&self, domain: Domain) -> Result<Fd> {
        let family = match domain {
            Domain::Inet => socket2::Domain::IPV4,
            Domain::Inet6 => socket2::Domain::IPV6,
            Domain::Local => return Err(TransportError::os("socket", Errno::Inval)),
        };
        let native = socket2::Socket::new(family, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| TransportError::from_io("socket", e))?;
        self.assign(native)
    }

    /// Register an existing native socket.
    ///
    /// When the table is full the socket is closed before the error returns.
    pub fn register(&self, native: OwnedFd) -> Result<Fd> {
        self.assign(socket2::Socket::from(native))
    }

    fn assign(&self, native: socket2::Socket) -> Result<Fd> {
        let raw = native.as_raw_fd();
        let fd = self
            .registry
            .assign(Resource::Socket(Arc::new(Socket::new(native))))?;
        debug!(%fd, native = raw, "socket registered");
        Ok(fd)
    }

    pub fn bind(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        let sock = self.socket(fd)?;
        let inet = addr
            .as_inet()
            .ok_or_else(|| TransportError::os("bind", Errno::Inval))?;
        sock.native
            .bind(&(*inet).into())
            .map_err(|e| TransportError::from_io("bind", e))
    }

    pub fn listen(&self, fd: Fd, backlog: i32) -> Result<()> {
        let sock = self.socket(fd)?;
        sock.native
            .listen(backlog)
            .map_err(|e| TransportError::from_io("listen", e))
    }

    pub fn accept(&self, fd: Fd) -> Result<(Fd, SockAddr)> {
        let sock = self.socket(fd)?;
        let accepted = sock.native.accept();
        sock.clear(Ready::IN);
        let (native, peer) = accepted.map_err(|e| TransportError::from_io("accept", e))?;
        let peer = peer
            .as_socket()
            .map(SockAddr::Inet)
            .ok_or_else(|| TransportError::os("accept", Errno::Inval))?;
        let new_fd = self.assign(native)?;
        Ok((new_fd, peer))
    }

    pub fn connect(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        let sock = self.socket(fd)?;
        let inet = addr
            .as_inet()
            .ok_or_else(|| TransportError::os("connect", Errno::Inval))?;
        sock.native
            .connect(&(*inet).into())
            .map_err(|e| TransportError::from_io("connect", e))
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let sock = self.socket(fd)?;
        let n = (&sock.native).read(buf);
        sock.clear(Ready::IN);
        n.map_err(|e| TransportError::from_io("recv", e))
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let sock = self.socket(fd)?;
        let n = sock.native.send_with_flags(buf, SEND_FLAGS);
        sock.clear(Ready::OUT);
        n.map_err(|e| TransportError::from_io("send", e))
    }

    /// Shut down both directions, then free the descriptor.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let sock = self.socket(fd)?;
        // ENOTCONN is expected for listeners.
        let _ = sock.native.shutdown(Shutdown::Both);
        if !self.registry.release(fd, &Resource::Socket(Arc::clone(&sock))) {
            return Err(TransportError::BadHandle(fd));
        }
        debug!(%fd, "socket closed");
        Ok(())
    }

    pub fn set_nonblocking(&self, fd: Fd, nonblocking: bool) -> Result<()> {
        let sock = self.socket(fd)?;
        sock.native
            .set_nonblocking(nonblocking)
            .map_err(|e| TransportError::from_io("ioctl", e))
    }

    pub fn local_addr(&self, fd: Fd) -> Result<SockAddr> {
        let sock = self.socket(fd)?;
        inet_name("getsockname", sock.native.local_addr())
    }

    pub fn peer_addr(&self, fd: Fd) -> Result<SockAddr> {
        let sock = self.socket(fd)?;
        inet_name("getpeername", sock.native.peer_addr())
    }

    pub fn get_opt(&self, fd: Fd, opt: SockOpt) -> Result<i32> {
        let sock = self.socket(fd)?;
        let native = &sock.native;
        let value = match opt {
            SockOpt::Type => native.r#type().map(libc::c_int::from),
            SockOpt::NoDelay => native.nodelay().map(i32::from),
            SockOpt::RecvBuf => native.recv_buffer_size().map(clamp_size),
            SockOpt::SendBuf => native.send_buffer_size().map(clamp_size),
            SockOpt::ReuseAddr => native.reuse_address().map(i32::from),
        };
        value.map_err(|e| TransportError::from_io("getsockopt", e))
    }

    pub fn set_opt(&self, fd: Fd, opt: SockOpt, value: i32) -> Result<()> {
        let sock = self.socket(fd)?;
        let native = &sock.native;
        let size = || usize::try_from(value).map_err(|_| TransportError::os("setsockopt", Errno::Inval));
        let applied = match opt {
            SockOpt::Type => return Err(TransportError::os("setsockopt", Errno::Inval)),
            SockOpt::NoDelay => native.set_nodelay(value != 0),
            SockOpt::RecvBuf => native.set_recv_buffer_size(size()?),
            SockOpt::SendBuf => native.set_send_buffer_size(size()?),
            SockOpt::ReuseAddr => native.set_reuse_address(value != 0),
        };
        applied.map_err(|e| TransportError::from_io("setsockopt", e))?;
        trace!(%fd, ?opt, value, "socket option set");
        Ok(())
    }
}

fn clamp_size(size: usize) -> i32 {
    i32::try_from(size).unwrap_or(i32::MAX)
}

fn inet_name(op: &'static str, name: io::Result<socket2::SockAddr>) -> Result<SockAddr> {
    let name = name.map_err(|e| TransportError::from_io(op, e))?;
    name.as_socket()
        .map(SockAddr::Inet)
        .ok_or_else(|| TransportError::os(op, Errno::Inval))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SockAddr {
        SockAddr::Inet("127.0.0.1:0".parse().unwrap())
    }

    fn listener(adapter: &SocketAdapter) -> (Fd, SockAddr) {
        let fd = adapter.open(Domain::Inet).unwrap();
        adapter.set_opt(fd, SockOpt::ReuseAddr, 1).unwrap();
        adapter.bind(fd, &loopback()).unwrap();
        adapter.listen(fd, 8).unwrap();
        let addr = adapter.local_addr(fd).unwrap();
        (fd, addr)
    }

    #[test]
    fn connect_accept_and_exchange() {
        let adapter = SocketAdapter::new(Arc::new(Registry::new()));
        let (lfd, addr) = listener(&adapter);

        let cfd = adapter.open(Domain::Inet).unwrap();
        adapter.connect(cfd, &addr).unwrap();
        let (sfd, peer) = adapter.accept(lfd).unwrap();
        assert_eq!(peer, adapter.local_addr(cfd).unwrap());
        assert_eq!(adapter.peer_addr(cfd).unwrap(), addr);

        assert_eq!(adapter.write(cfd, b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(adapter.read(sfd, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        adapter.close(cfd).unwrap();
        assert_eq!(adapter.read(sfd, &mut buf).unwrap(), 0);
        adapter.close(sfd).unwrap();
        adapter.close(lfd).unwrap();
    }

    #[test]
    fn nonblocking_read_would_block() {
        let adapter = SocketAdapter::new(Arc::new(Registry::new()));
        let (lfd, addr) = listener(&adapter);
        let cfd = adapter.open(Domain::Inet).unwrap();
        adapter.connect(cfd, &addr).unwrap();
        let (sfd, _) = adapter.accept(lfd).unwrap();

        adapter.set_nonblocking(sfd, true).unwrap();
        let err = adapter.read(sfd, &mut [0u8; 4]).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.errno(), Errno::Again);
    }

    #[test]
    fn options_round_trip() {
        let adapter = SocketAdapter::new(Arc::new(Registry::new()));
        let fd = adapter.open(Domain::Inet).unwrap();
        assert_eq!(adapter.get_opt(fd, SockOpt::Type).unwrap(), SOCK_STREAM);
        adapter.set_opt(fd, SockOpt::NoDelay, 1).unwrap();
        assert_ne!(adapter.get_opt(fd, SockOpt::NoDelay).unwrap(), 0);
        assert_eq!(
            adapter.set_opt(fd, SockOpt::Type, 1).unwrap_err().errno(),
            Errno::Inval
        );
    }

    #[test]
    fn close_releases_slot_and_silences_socket() {
        let registry = Arc::new(Registry::new());
        let adapter = SocketAdapter::new(Arc::clone(&registry));
        let fd = adapter.open(Domain::Inet).unwrap();
        let sock = registry.lookup_socket(fd).unwrap();
        assert!(sock.is_live());

        adapter.close(fd).unwrap();
        assert!(!sock.is_live());
        assert_eq!(sock.network_events().unwrap(), Ready::NVAL);
        assert!(registry.lookup(fd).is_none());
        assert!(matches!(
            adapter.close(fd),
            Err(TransportError::BadHandle(_))
        ));
    }

    #[test]
    fn buffer_and_reuse_options_apply() {
        let adapter = SocketAdapter::new(Arc::new(Registry::new()));
        let fd = adapter.open(Domain::Inet).unwrap();
        adapter.set_opt(fd, SockOpt::ReuseAddr, 1).unwrap();
        assert_eq!(adapter.get_opt(fd, SockOpt::ReuseAddr).unwrap(), 1);
        adapter.set_opt(fd, SockOpt::RecvBuf, 16 * 1024).unwrap();
        assert!(adapter.get_opt(fd, SockOpt::RecvBuf).unwrap() >= 16 * 1024);
        assert_eq!(
            adapter.set_opt(fd, SockOpt::SendBuf, -1).unwrap_err().errno(),
            Errno::Inval
        );
    }

    #[test]
    fn register_adopts_native_listener() {
        let adapter = SocketAdapter::new(Arc::new(Registry::new()));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = adapter.register(OwnedFd::from(listener)).unwrap();
        assert_eq!(adapter.local_addr(fd).unwrap(), SockAddr::Inet(addr));

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (sfd, peer) = adapter.accept(fd).unwrap();
        assert!(peer.as_inet().is_some());
        adapter.close(sfd).unwrap();
        adapter.close(fd).unwrap();
    }

    #[test]
    fn register_on_full_table_is_exhausted() {
        let adapter = SocketAdapter::new(Arc::new(Registry::with_capacity(1)));
        adapter.open(Domain::Inet).unwrap();
        let err = adapter.open(Domain::Inet).unwrap_err();
        assert!(err.is_exhaustion());
    }

    #[test]
    fn local_domain_is_not_a_socket() {
        let adapter = SocketAdapter::new(Arc::new(Registry::new()));
        let err = adapter.open(Domain::Local).unwrap_err();
        assert_eq!(err.errno(), Errno::Inval);
    }
}
