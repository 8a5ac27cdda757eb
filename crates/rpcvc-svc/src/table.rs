use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rpcvc_transport::Fd;
use tracing::{debug, warn};

use crate::xprt::Xprt;

/// Registered transports, keyed by descriptor.
#[derive(Debug, Default)]
pub struct XprtTable {
    xprts: BTreeMap<Fd, Box<dyn Xprt>>,
}

impl XprtTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its descriptor.
    ///
    /// Returns the transport previously registered there, if any.
    pub fn register(&mut self, xprt: Box<dyn Xprt>) -> Option<Box<dyn Xprt>> {
        let fd = xprt.fd();
        debug!(%fd, role = %xprt.role(), "transport registered");
        self.xprts.insert(fd, xprt)
    }

    /// Remove and return the transport on `fd` without destroying it.
    pub fn unregister(&mut self, fd: Fd) -> Option<Box<dyn Xprt>> {
        self.xprts.remove(&fd)
    }

    pub fn get(&self, fd: Fd) -> Option<&dyn Xprt> {
        self.xprts.get(&fd).map(|x| x.as_ref())
    }

    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut Box<dyn Xprt>> {
        self.xprts.get_mut(&fd)
    }

    /// Registered descriptors in ascending order.
    pub fn fds(&self) -> Vec<Fd> {
        self.xprts.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.xprts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xprts.is_empty()
    }

    /// Destroy idle connections.
    ///
    /// A non-zero `timeout` destroys every eligible connection idle for at
    /// least that long. A zero `timeout` destroys only the single most idle
    /// one. Blocking connections are eligible only with `clean_blocking`.
    /// Returns whether anything was destroyed.
    pub fn clean_idle(&mut self, timeout: Duration, clean_blocking: bool) -> bool {
        self.clean_idle_at(Instant::now(), timeout, clean_blocking)
    }

    pub(crate) fn clean_idle_at(
        &mut self,
        now: Instant,
        timeout: Duration,
        clean_blocking: bool,
    ) -> bool {
        let mut victims = Vec::new();
        let mut most_idle: Option<(Fd, Duration)> = None;
        for (&fd, xprt) in &self.xprts {
            let Some(conn) = xprt.as_connection() else {
                continue;
            };
            if !clean_blocking && !conn.is_nonblocking() {
                continue;
            }
            let idle = now.saturating_duration_since(conn.last_activity());
            if timeout.is_zero() {
                if most_idle.is_none_or(|(_, longest)| idle > longest) {
                    most_idle = Some((fd, idle));
                }
            } else if idle >= timeout {
                victims.push(fd);
            }
        }
        victims.extend(most_idle.map(|(fd, _)| fd));

        for fd in &victims {
            if let Some(xprt) = self.xprts.remove(fd) {
                warn!(%fd, "reclaiming idle connection");
                xprt.destroy();
            }
        }
        !victims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::xprt::ControlRequest;
    use rpcvc_transport::{Descriptors, Domain, SockAddr};

    /// Accept `n` pipe connections; returns the server-side connections and
    /// the client descriptors.
    fn connections(io: &Descriptors, name: &str, n: usize) -> (Vec<Connection>, Vec<Fd>) {
        let addr = SockAddr::local(name).unwrap();
        let lfd = io.socket(Domain::Local).unwrap();
        io.bind(lfd, &addr).unwrap();
        io.listen(lfd, 8).unwrap();
        let mut conns = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..n {
            let cfd = io.socket(Domain::Local).unwrap();
            io.connect(cfd, &addr).unwrap();
            let (sfd, _) = io.accept(lfd).unwrap();
            conns.push(Connection::from_fd(io, sfd, 0, 0).unwrap());
            clients.push(cfd);
        }
        io.close(lfd).unwrap();
        (conns, clients)
    }

    fn table_with_idle(
        io: &Descriptors,
        name: &str,
        idle_secs: &[u64],
        nonblocking: bool,
        now: Instant,
    ) -> (XprtTable, Vec<Fd>) {
        let (conns, _clients) = connections(io, name, idle_secs.len());
        let mut table = XprtTable::new();
        let mut fds = Vec::new();
        for (mut conn, secs) in conns.into_iter().zip(idle_secs) {
            if nonblocking {
                conn.control(ControlRequest::SetConnMaxRec(1024)).unwrap();
            }
            conn.set_last_activity(now - Duration::from_secs(*secs));
            fds.push(conn.fd());
            assert!(table.register(Box::new(conn)).is_none());
        }
        (table, fds)
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn zero_timeout_destroys_only_the_most_idle() {
        let io = Descriptors::in_process();
        let now = later();
        let (mut table, fds) = table_with_idle(&io, "clean-zero", &[10, 50, 30], true, now);

        assert!(table.clean_idle_at(now, Duration::ZERO, false));
        assert_eq!(table.len(), 2);
        assert!(table.get(fds[1]).is_none());
        assert!(io.registry().lookup(fds[1]).is_none());
        assert!(table.get(fds[0]).is_some());
        assert!(table.get(fds[2]).is_some());
    }

    #[test]
    fn timeout_destroys_all_at_or_past_it() {
        let io = Descriptors::in_process();
        let now = later();
        let (mut table, fds) =
            table_with_idle(&io, "clean-timeout", &[5, 20, 30, 19], true, now);

        assert!(table.clean_idle_at(now, Duration::from_secs(20), false));
        assert_eq!(table.fds(), vec![fds[0], fds[3]]);
    }

    #[test]
    fn nothing_idle_enough_is_a_no_op() {
        let io = Descriptors::in_process();
        let now = later();
        let (mut table, _) = table_with_idle(&io, "clean-none", &[1, 2], true, now);
        assert!(!table.clean_idle_at(now, Duration::from_secs(60), false));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn blocking_connections_need_clean_blocking() {
        let io = Descriptors::in_process();
        let now = later();
        let (mut table, _) = table_with_idle(&io, "clean-blocking", &[100, 200], false, now);

        assert!(!table.clean_idle_at(now, Duration::ZERO, false));
        assert!(!table.clean_idle_at(now, Duration::from_secs(10), false));
        assert_eq!(table.len(), 2);

        assert!(table.clean_idle_at(now, Duration::from_secs(10), true));
        assert!(table.is_empty());
    }

    #[test]
    fn unregister_does_not_destroy() {
        let io = Descriptors::in_process();
        let (mut conns, _clients) = connections(&io, "table-unregister", 1);
        let conn = conns.remove(0);
        let fd = conn.fd();
        let mut table = XprtTable::new();
        table.register(Box::new(conn));
        let xprt = table.unregister(fd).unwrap();
        assert!(table.is_empty());
        assert!(io.registry().lookup(fd).is_some());
        xprt.destroy();
        assert!(io.registry().lookup(fd).is_none());
    }
}
