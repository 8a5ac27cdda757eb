use std::sync::Arc;
use std::time::Duration;

use rpcvc_transport::{Descriptors, Domain, Errno, Fd, SockAddr, SockOpt};
use tracing::{debug, error, info, warn};

use crate::codec::{CallMessage, HeaderCodec, MessageCodec};
use crate::config::{transport_size, SvcConfig};
use crate::connection::Connection;
use crate::error::{Result, SvcError};
use crate::table::XprtTable;
use crate::xprt::{ControlRequest, Role, Xprt, XprtStat};

/// A listening transport. Each `recv` accepts one connection and registers
/// it in the table; it never yields a call.
#[derive(Debug)]
pub struct Rendezvous {
    io: Descriptors,
    fd: Fd,
    local: SockAddr,
    sendsize: u32,
    recvsize: u32,
    maxrec: usize,
    config: SvcConfig,
    codec: Arc<dyn MessageCodec>,
    died: bool,
    closed: bool,
}

impl Rendezvous {
    /// Wrap a listening descriptor.
    ///
    /// The descriptor is switched to non-blocking so an accept retried
    /// after reclamation cannot stall the server.
    pub fn create(
        io: &Descriptors,
        fd: Fd,
        sendsize: u32,
        recvsize: u32,
        config: &SvcConfig,
    ) -> Result<Self> {
        let local = io.local_addr(fd)?;
        io.set_nonblocking(fd, true)?;
        let domain = local.domain();
        info!(%fd, %local, "rendezvous created");
        Ok(Self {
            io: io.clone(),
            fd,
            sendsize: transport_size(domain, sendsize),
            recvsize: transport_size(domain, recvsize),
            maxrec: config.max_record_size,
            config: config.clone(),
            codec: Arc::new(HeaderCodec),
            local,
            died: false,
            closed: false,
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn local_addr(&self) -> &SockAddr {
        &self.local
    }

    /// Accept one connection, reclaiming the most idle one once if the
    /// descriptor table is full.
    ///
    /// A failure that is not about one client or about descriptor pressure
    /// means the listener itself is broken; the rendezvous then reports
    /// itself dead so the server destroys it.
    fn accept(&mut self, table: &mut XprtTable) -> Option<(Fd, SockAddr)> {
        let mut reclaimed = false;
        loop {
            match self.io.accept(self.fd) {
                Ok(accepted) => return Some(accepted),
                Err(e) if e.errno() == Errno::Intr => continue,
                Err(e) if e.is_exhaustion() && !reclaimed => {
                    warn!(fd = %self.fd, error = %e, "out of descriptors, reclaiming an idle connection");
                    reclaimed = true;
                    table.clean_idle(Duration::ZERO, false);
                }
                Err(e) if e.is_transient() => return None,
                Err(e) if e.is_exhaustion() || matches!(e.errno(), Errno::ConnReset | Errno::ConnRefused) => {
                    warn!(fd = %self.fd, error = %e, "accept failed");
                    return None;
                }
                Err(e) => {
                    error!(fd = %self.fd, error = %e, "listener failed, rendezvous is dead");
                    self.died = true;
                    return None;
                }
            }
        }
    }
}

impl Xprt for Rendezvous {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn role(&self) -> Role {
        Role::Rendezvous
    }

    fn recv(&mut self, table: &mut XprtTable) -> Option<CallMessage> {
        let (cfd, peer) = self.accept(table)?;
        let conn = Connection::build(
            &self.io,
            cfd,
            self.sendsize,
            self.recvsize,
            self.maxrec,
            &self.config,
            Arc::clone(&self.codec),
        );
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!(fd = %cfd, error = %e, "could not set up accepted connection");
                let _ = self.io.close(cfd);
                return None;
            }
        };
        if self.local.domain() != Domain::Local {
            if let Err(e) = self.io.set_opt(cfd, SockOpt::NoDelay, 1) {
                debug!(fd = %cfd, error = %e, "TCP_NODELAY not applied");
            }
        }
        info!(listener = %self.fd, fd = %cfd, %peer, maxrec = self.maxrec, "accepted connection");
        if let Some(displaced) = table.register(Box::new(conn)) {
            error!(fd = %displaced.fd(), "descriptor already had a transport");
        }
        None
    }

    fn stat(&self) -> XprtStat {
        if self.died {
            XprtStat::Died
        } else {
            XprtStat::Idle
        }
    }

    fn reply(&mut self, _body: &[u8]) -> Result<()> {
        Err(SvcError::Unsupported {
            op: "reply",
            role: Role::Rendezvous.as_str(),
        })
    }

    fn control(&mut self, request: ControlRequest) -> Result<usize> {
        match request {
            ControlRequest::GetConnMaxRec => Ok(self.maxrec),
            ControlRequest::SetConnMaxRec(maxrec) => {
                self.maxrec = maxrec;
                Ok(maxrec)
            }
            ControlRequest::GetRecvSize => Ok(self.recvsize as usize),
            ControlRequest::GetSendSize => Ok(self.sendsize as usize),
        }
    }

    fn destroy(mut self: Box<Self>) {
        debug!(fd = %self.fd, "destroying rendezvous");
        self.close();
    }
}

impl Rendezvous {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.io.close(self.fd) {
                debug!(fd = %self.fd, error = %e, "close failed");
            }
        }
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcvc_transport::host::{LocalPipeHost, NativePipe, OpenError, PipeHost};
    use rpcvc_transport::{PipeConfig, Registry};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn local_listener(io: &Descriptors, name: &str) -> (Fd, SockAddr) {
        let addr = SockAddr::local(name).unwrap();
        let fd = io.socket(Domain::Local).unwrap();
        io.bind(fd, &addr).unwrap();
        io.listen(fd, 8).unwrap();
        (fd, addr)
    }

    #[test]
    fn accept_registers_connection() {
        let io = Descriptors::in_process();
        let (lfd, addr) = local_listener(&io, "rdv-accept");
        let mut rdv = Rendezvous::create(&io, lfd, 0, 0, &SvcConfig::default()).unwrap();
        let mut table = XprtTable::new();

        let cfd = io.socket(Domain::Local).unwrap();
        io.connect(cfd, &addr).unwrap();
        assert!(rdv.recv(&mut table).is_none());
        assert_eq!(table.len(), 1);

        let conn_fd = table.fds()[0];
        let conn = table.get(conn_fd).unwrap();
        assert_eq!(conn.role(), Role::Connection);
        assert!(!conn.as_connection().unwrap().is_nonblocking());
        assert_eq!(rdv.stat(), XprtStat::Idle);
    }

    #[test]
    fn record_cap_propagates_to_connections() {
        let io = Descriptors::in_process();
        let (lfd, addr) = local_listener(&io, "rdv-cap");
        let mut rdv = Rendezvous::create(&io, lfd, 0, 0, &SvcConfig::default()).unwrap();
        assert_eq!(rdv.control(ControlRequest::SetConnMaxRec(4096)).unwrap(), 4096);
        assert_eq!(rdv.control(ControlRequest::GetConnMaxRec).unwrap(), 4096);
        let mut table = XprtTable::new();

        let cfd = io.socket(Domain::Local).unwrap();
        io.connect(cfd, &addr).unwrap();
        rdv.recv(&mut table);

        let conn_fd = table.fds()[0];
        let conn = table.get_mut(conn_fd).unwrap();
        assert_eq!(conn.control(ControlRequest::GetConnMaxRec).unwrap(), 4096);
        assert!(conn.control(ControlRequest::GetRecvSize).unwrap() <= 4096);
        assert!(conn.as_connection().unwrap().is_nonblocking());
    }

    #[test]
    fn recv_without_client_is_quiet() {
        let io = Descriptors::in_process();
        let (lfd, _) = local_listener(&io, "rdv-empty");
        let mut rdv = Rendezvous::create(&io, lfd, 0, 0, &SvcConfig::default()).unwrap();
        let mut table = XprtTable::new();
        assert!(rdv.recv(&mut table).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn reply_is_unsupported() {
        let io = Descriptors::in_process();
        let (lfd, _) = local_listener(&io, "rdv-reply");
        let mut rdv = Rendezvous::create(&io, lfd, 0, 0, &SvcConfig::default()).unwrap();
        assert!(matches!(
            rdv.reply(b"x"),
            Err(SvcError::Unsupported {
                op: "reply",
                role: "rendezvous"
            })
        ));
    }

    #[test]
    fn sizes_negotiate_per_domain() {
        let io = Descriptors::in_process();
        let (lfd, _) = local_listener(&io, "rdv-sizes");
        let mut rdv = Rendezvous::create(&io, lfd, 0, 1 << 20, &SvcConfig::default()).unwrap();
        assert_eq!(rdv.control(ControlRequest::GetSendSize).unwrap(), 9000);
        assert_eq!(rdv.control(ControlRequest::GetRecvSize).unwrap(), 256 * 1024);

        let tfd = io.socket(Domain::Inet).unwrap();
        io.bind(tfd, &SockAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
            .unwrap();
        io.listen(tfd, 8).unwrap();
        let mut tcp = Rendezvous::create(&io, tfd, 0, 0, &SvcConfig::default()).unwrap();
        assert_eq!(tcp.control(ControlRequest::GetSendSize).unwrap(), 64 * 1024);
    }

    #[test]
    fn tcp_accept_enables_nodelay() {
        let io = Descriptors::in_process();
        let tfd = io.socket(Domain::Inet).unwrap();
        io.bind(tfd, &SockAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
            .unwrap();
        io.listen(tfd, 8).unwrap();
        let bound = io.local_addr(tfd).unwrap();
        let mut rdv = Rendezvous::create(&io, tfd, 0, 0, &SvcConfig::default()).unwrap();
        let mut table = XprtTable::new();

        let cfd = io.socket(Domain::Inet).unwrap();
        io.connect(cfd, &bound).unwrap();
        // The listener is non-blocking; the connection may take a moment to queue.
        for _ in 0..100 {
            rdv.recv(&mut table);
            if !table.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let conn_fd = table.fds()[0];
        assert_eq!(io.get_opt(conn_fd, SockOpt::NoDelay).unwrap(), 1);
        let _ = io.close(cfd);
    }

    struct RefusingHost {
        inner: LocalPipeHost,
        refuse: AtomicBool,
    }

    impl PipeHost for RefusingHost {
        fn create_instance(&self, name: &str) -> std::result::Result<Box<dyn NativePipe>, i32> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(8);
            }
            self.inner.create_instance(name)
        }

        fn open(&self, name: &str) -> std::result::Result<Box<dyn NativePipe>, OpenError> {
            self.inner.open(name)
        }

        fn wait_available(&self, name: &str, timeout: Duration) -> bool {
            self.inner.wait_available(name, timeout)
        }
    }

    #[test]
    fn broken_listener_marks_rendezvous_dead() {
        let host = Arc::new(RefusingHost {
            inner: LocalPipeHost::new(),
            refuse: AtomicBool::new(false),
        });
        let io = Descriptors::with_host(
            Arc::new(Registry::new()),
            Arc::clone(&host) as Arc<dyn PipeHost>,
            PipeConfig::default(),
        );
        let (lfd, addr) = local_listener(&io, "rdv-broken");
        let mut rdv = Rendezvous::create(&io, lfd, 0, 0, &SvcConfig::default()).unwrap();
        let mut table = XprtTable::new();

        let cfd = io.socket(Domain::Local).unwrap();
        io.connect(cfd, &addr).unwrap();
        host.refuse.store(true, Ordering::SeqCst);

        // The waiting client is still served.
        assert!(rdv.recv(&mut table).is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(rdv.stat(), XprtStat::Idle);

        // No instance to wait on any more: the listener is gone for good.
        assert!(rdv.recv(&mut table).is_none());
        assert_eq!(rdv.stat(), XprtStat::Died);
    }
}
