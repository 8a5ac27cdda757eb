use std::sync::Arc;

use crate::addr::{Domain, SockAddr};
use crate::error::{Result, TransportError};
use crate::host::{LocalPipeHost, PipeHost, UnixPipeHost};
use crate::pipe::{PeerCredentials, PipeConfig, PipeEmulator};
use crate::registry::{Fd, Registry, Resource};
use crate::socket::{SockOpt, SocketAdapter};

/// Socket-style verbs over virtual descriptors.
///
/// Every verb resolves the descriptor in the shared [`Registry`] and
/// dispatches to the socket adapter or the pipe emulator. Clones share the
/// same table and pipe namespace.
#[derive(Debug, Clone)]
pub struct Descriptors {
    registry: Arc<Registry>,
    pub(crate) sockets: SocketAdapter,
    pub(crate) pipes: PipeEmulator,
}

impl Descriptors {
    /// A default-sized table whose local endpoints are filesystem sockets,
    /// reachable from other tables and other processes.
    pub fn new() -> Self {
        Self::with_host(
            Arc::new(Registry::new()),
            Arc::new(UnixPipeHost::new()),
            PipeConfig::default(),
        )
    }

    /// A default-sized table with a private in-memory pipe namespace.
    pub fn in_process() -> Self {
        Self::with_host(
            Arc::new(Registry::new()),
            Arc::new(LocalPipeHost::new()),
            PipeConfig::default(),
        )
    }

    pub fn with_host(registry: Arc<Registry>, host: Arc<dyn PipeHost>, config: PipeConfig) -> Self {
        Self {
            sockets: SocketAdapter::new(Arc::clone(&registry)),
            pipes: PipeEmulator::new(Arc::clone(&registry), host, config),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn resolve(&self, fd: Fd) -> Result<Resource> {
        self.registry
            .lookup(fd)
            .ok_or(TransportError::BadHandle(fd))
    }

    /// Create a stream descriptor. `Local` yields a pipe descriptor.
    pub fn socket(&self, domain: Domain) -> Result<Fd> {
        match domain {
            Domain::Local => self.pipes.open(),
            Domain::Inet | Domain::Inet6 => self.sockets.open(domain),
        }
    }

    /// Register an already-open native socket.
    #[cfg(unix)]
    pub fn register_socket(&self, native: std::os::fd::OwnedFd) -> Result<Fd> {
        self.sockets.register(native)
    }

    pub fn bind(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.bind(fd, addr),
            Resource::Pipe(_) => self.pipes.bind(fd, addr),
        }
    }

    pub fn listen(&self, fd: Fd, backlog: i32) -> Result<()> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.listen(fd, backlog),
            Resource::Pipe(_) => self.pipes.listen(fd),
        }
    }

    pub fn accept(&self, fd: Fd) -> Result<(Fd, SockAddr)> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.accept(fd),
            Resource::Pipe(_) => self.pipes.accept(fd),
        }
    }

    pub fn connect(&self, fd: Fd, addr: &SockAddr) -> Result<()> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.connect(fd, addr),
            Resource::Pipe(_) => self.pipes.connect(fd, addr),
        }
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.read(fd, buf),
            Resource::Pipe(_) => self.pipes.read(fd, buf),
        }
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.write(fd, buf),
            Resource::Pipe(_) => self.pipes.write(fd, buf),
        }
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.close(fd),
            Resource::Pipe(_) => self.pipes.close(fd),
        }
    }

    pub fn set_nonblocking(&self, fd: Fd, nonblocking: bool) -> Result<()> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.set_nonblocking(fd, nonblocking),
            Resource::Pipe(_) => self.pipes.set_nonblocking(fd, nonblocking),
        }
    }

    pub fn local_addr(&self, fd: Fd) -> Result<SockAddr> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.local_addr(fd),
            Resource::Pipe(_) => self.pipes.local_addr(fd),
        }
    }

    pub fn peer_addr(&self, fd: Fd) -> Result<SockAddr> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.peer_addr(fd),
            Resource::Pipe(_) => self.pipes.peer_addr(fd),
        }
    }

    pub fn get_opt(&self, fd: Fd, opt: SockOpt) -> Result<i32> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.get_opt(fd, opt),
            Resource::Pipe(_) => self.pipes.get_opt(fd, opt),
        }
    }

    pub fn set_opt(&self, fd: Fd, opt: SockOpt, value: i32) -> Result<()> {
        match self.resolve(fd)? {
            Resource::Socket(_) => self.sockets.set_opt(fd, opt, value),
            Resource::Pipe(_) => self.pipes.set_opt(fd, opt, value),
        }
    }

    /// Credentials of the peer process. Only pipe server ends know them.
    pub fn peer_credentials(&self, fd: Fd) -> Result<Option<PeerCredentials>> {
        match self.resolve(fd)? {
            Resource::Socket(_) => Ok(None),
            Resource::Pipe(_) => self.pipes.peer_credentials(fd).map(Some),
        }
    }
}

impl Default for Descriptors {
    fn default() -> Self {
        Self::new()
    }
}
