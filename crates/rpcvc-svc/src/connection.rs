//! Per-connection transport.
//!
//! A connection reads records through [`VcIo`], which applies the blocking
//! read ceiling and the write stall ceiling and marks the connection dead
//! when either trips. Non-blocking connections assemble records across
//! calls; `recv` returns `None` until one is complete.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rpcvc_record::{RecordConfig, RecordReader, RecordWriter, HEADER_SIZE};
use rpcvc_transport::{Descriptors, Errno, Fd, PeerCredentials, PollFd, Ready, SockAddr};
use tracing::{debug, warn};

use crate::codec::{CallMessage, HeaderCodec, MessageCodec, ReplyMessage};
use crate::config::{transport_size, SvcConfig};
use crate::error::{Result, SvcError};
use crate::table::XprtTable;
use crate::xprt::{ControlRequest, Role, Xprt, XprtStat};

#[derive(Debug)]
struct ConnState {
    status: XprtStat,
    xid: u32,
    sendsize: u32,
    recvsize: u32,
    maxrec: usize,
    nonblock: bool,
    last_recv: Instant,
    diagnostic: Option<String>,
}

impl ConnState {
    fn die(&mut self, fd: Fd, reason: impl Into<String>) {
        if self.status == XprtStat::Died {
            return;
        }
        let reason = reason.into();
        warn!(%fd, %reason, "connection died");
        self.status = XprtStat::Died;
        self.diagnostic = Some(reason);
    }
}

/// Byte-level read and write on a connection's descriptor.
#[derive(Debug, Clone)]
struct VcIo {
    io: Descriptors,
    fd: Fd,
    state: Arc<Mutex<ConnState>>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl VcIo {
    fn die(&self, reason: impl Into<String>) {
        self.state.lock().die(self.fd, reason);
    }

    /// Wait until the descriptor is readable or the read ceiling passes.
    fn wait_readable(&self) -> io::Result<()> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut fds = [PollFd::new(self.fd, Ready::IN)];
            match self.io.poll_timeout(&mut fds, Some(remaining)) {
                Ok(0) if remaining.is_zero() => {
                    self.die(format!("no data for {:?}", self.read_timeout));
                    return Err(io::ErrorKind::TimedOut.into());
                }
                Ok(0) => continue,
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    self.die(e.to_string());
                    return Err(e.into());
                }
            }
        }
    }
}

impl Read for VcIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let nonblock = self.state.lock().nonblock;
        if !nonblock {
            self.wait_readable()?;
        }
        match self.io.read(self.fd, buf) {
            Ok(0) => {
                self.die("peer closed the connection");
                Ok(0)
            }
            Ok(n) => {
                self.state.lock().last_recv = Instant::now();
                Ok(n)
            }
            // Non-blocking: nothing yet. The record reader keeps what it has.
            Err(e) if nonblock && e.errno() == Errno::Again => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(e) if e.errno() == Errno::Intr => Err(io::ErrorKind::Interrupted.into()),
            Err(e) if e.errno() == Errno::Pipe => {
                self.die("peer closed the connection");
                Ok(0)
            }
            Err(e) => {
                self.die(e.to_string());
                Err(e.into())
            }
        }
    }
}

impl Write for VcIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let started = Instant::now();
        loop {
            match self.io.write(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.is_transient() => {
                    if started.elapsed() > self.write_timeout {
                        self.die(format!("write stalled for {:?}", self.write_timeout));
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    std::thread::yield_now();
                }
                Err(e) => {
                    self.die(e.to_string());
                    return Err(e.into());
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A connected server transport.
pub struct Connection {
    io: Descriptors,
    fd: Fd,
    state: Arc<Mutex<ConnState>>,
    reader: RecordReader<VcIo>,
    writer: RecordWriter<VcIo>,
    codec: Arc<dyn MessageCodec>,
    local: SockAddr,
    peer: Option<SockAddr>,
    credentials: Option<PeerCredentials>,
    closed: bool,
}

impl Connection {
    /// Adopt an already-connected descriptor as a blocking connection.
    ///
    /// The connection closes the descriptor when destroyed or dropped. On
    /// error the descriptor is left open.
    pub fn from_fd(io: &Descriptors, fd: Fd, sendsize: u32, recvsize: u32) -> Result<Self> {
        Self::build(
            io,
            fd,
            sendsize,
            recvsize,
            0,
            &SvcConfig::default(),
            Arc::new(HeaderCodec),
        )
    }

    /// Adopt a connected descriptor, taking sizes, record cap and ceilings
    /// from `config`.
    pub fn with_config(io: &Descriptors, fd: Fd, config: &SvcConfig) -> Result<Self> {
        Self::build(
            io,
            fd,
            config.sendsize,
            config.recvsize,
            config.max_record_size,
            config,
            Arc::new(HeaderCodec),
        )
    }

    pub(crate) fn build(
        io: &Descriptors,
        fd: Fd,
        sendsize: u32,
        recvsize: u32,
        maxrec: usize,
        config: &SvcConfig,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self> {
        let local = io.local_addr(fd)?;
        let sendsize = transport_size(local.domain(), sendsize);
        let recvsize = transport_size(local.domain(), recvsize);
        let state = Arc::new(Mutex::new(ConnState {
            status: XprtStat::Idle,
            xid: 0,
            sendsize,
            recvsize,
            maxrec: 0,
            nonblock: false,
            last_recv: Instant::now(),
            diagnostic: None,
        }));
        let vc = VcIo {
            io: io.clone(),
            fd,
            state: Arc::clone(&state),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        };
        let record = RecordConfig {
            max_record_size: 0,
            fragment_size: (sendsize as usize).saturating_sub(HEADER_SIZE).max(1),
            read_chunk: recvsize as usize,
        };
        let mut conn = Self {
            io: io.clone(),
            fd,
            state,
            reader: RecordReader::with_config(vc.clone(), record.clone()),
            writer: RecordWriter::with_config(vc, record),
            codec,
            peer: io.peer_addr(fd).ok(),
            credentials: io.peer_credentials(fd).ok().flatten(),
            local,
            closed: false,
        };
        if let Err(e) = conn.set_max_record(maxrec) {
            // The caller still owns the descriptor on failure.
            conn.closed = true;
            return Err(e);
        }
        debug!(%fd, sendsize, recvsize, maxrec, "connection created");
        Ok(conn)
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Apply a record cap. Non-zero switches the descriptor to non-blocking
    /// and clamps the receive size to the cap; zero restores blocking reads.
    pub fn set_max_record(&mut self, maxrec: usize) -> Result<()> {
        let nonblock = maxrec > 0;
        self.io.set_nonblocking(self.fd, nonblock)?;
        let mut st = self.state.lock();
        st.maxrec = maxrec;
        st.nonblock = nonblock;
        if nonblock {
            st.recvsize = st.recvsize.min(u32::try_from(maxrec).unwrap_or(u32::MAX));
        }
        self.reader.set_max_record_size(maxrec);
        self.reader.set_read_chunk(st.recvsize as usize);
        Ok(())
    }

    pub fn local_addr(&self) -> &SockAddr {
        &self.local
    }

    pub fn peer_addr(&self) -> Option<&SockAddr> {
        self.peer.as_ref()
    }

    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.credentials
    }

    pub fn is_nonblocking(&self) -> bool {
        self.state.lock().nonblock
    }

    /// When data last arrived.
    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_recv
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: Instant) {
        self.state.lock().last_recv = at;
    }

    /// Transaction id of the last call received.
    pub fn xid(&self) -> u32 {
        self.state.lock().xid
    }

    /// Why the connection died, if it did.
    pub fn diagnostic(&self) -> Option<String> {
        self.state.lock().diagnostic.clone()
    }

    fn die(&self, reason: impl Into<String>) {
        self.state.lock().die(self.fd, reason);
    }

    fn died(&self) -> SvcError {
        SvcError::Died {
            fd: self.fd,
            reason: self.diagnostic(),
        }
    }

    fn next_record(&mut self) -> Option<Bytes> {
        let result = if self.is_nonblocking() {
            self.reader.poll_record()
        } else {
            self.reader.read_record().map(Some)
        };
        match result {
            Ok(record) => record,
            Err(e) => {
                self.die(e.to_string());
                None
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.io.close(self.fd) {
            debug!(fd = %self.fd, error = %e, "close failed");
        }
    }
}

impl Xprt for Connection {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn role(&self) -> Role {
        Role::Connection
    }

    fn recv(&mut self, _table: &mut XprtTable) -> Option<CallMessage> {
        if self.stat() == XprtStat::Died {
            return None;
        }
        let record = self.next_record();
        let call = match record.map(|r| self.codec.decode_call(r)) {
            Some(Ok(call)) => Some(call),
            Some(Err(e)) => {
                self.die(e.to_string());
                None
            }
            None => None,
        };
        let mut st = self.state.lock();
        if st.status != XprtStat::Died {
            st.status = if self.reader.has_buffered_record() {
                XprtStat::MoreReqs
            } else {
                XprtStat::Idle
            };
        }
        if let Some(call) = &call {
            st.xid = call.xid;
        }
        call
    }

    fn stat(&self) -> XprtStat {
        self.state.lock().status
    }

    fn reply(&mut self, body: &[u8]) -> Result<()> {
        if self.stat() == XprtStat::Died {
            return Err(self.died());
        }
        let reply = ReplyMessage {
            xid: self.xid(),
            body: Bytes::copy_from_slice(body),
        };
        let mut buf = BytesMut::new();
        self.codec.encode_reply(&reply, &mut buf);
        if let Err(e) = self.writer.send_record(&buf) {
            self.die(e.to_string());
            return Err(self.died());
        }
        Ok(())
    }

    fn control(&mut self, request: ControlRequest) -> Result<usize> {
        match request {
            ControlRequest::GetConnMaxRec => Ok(self.state.lock().maxrec),
            ControlRequest::SetConnMaxRec(maxrec) => {
                self.set_max_record(maxrec)?;
                Ok(maxrec)
            }
            ControlRequest::GetRecvSize => Ok(self.state.lock().recvsize as usize),
            ControlRequest::GetSendSize => Ok(self.state.lock().sendsize as usize),
        }
    }

    fn destroy(mut self: Box<Self>) {
        debug!(fd = %self.fd, "destroying connection");
        self.close();
    }

    fn as_connection(&self) -> Option<&Connection> {
        Some(self)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("status", &st.status)
            .field("maxrec", &st.maxrec)
            .field("nonblock", &st.nonblock)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcvc_record::encode_record;
    use rpcvc_transport::Domain;

    /// A connected pair of pipe descriptors: (server side, client side).
    fn pipe_pair(io: &Descriptors, name: &str) -> (Fd, Fd) {
        let addr = SockAddr::local(name).unwrap();
        let lfd = io.socket(Domain::Local).unwrap();
        io.bind(lfd, &addr).unwrap();
        io.listen(lfd, 4).unwrap();
        let cfd = io.socket(Domain::Local).unwrap();
        io.connect(cfd, &addr).unwrap();
        let (sfd, _) = io.accept(lfd).unwrap();
        io.close(lfd).unwrap();
        (sfd, cfd)
    }

    fn send_call(io: &Descriptors, fd: Fd, xid: u32, body: &[u8]) {
        let mut msg = BytesMut::new();
        HeaderCodec.encode_call(
            &CallMessage {
                xid,
                body: Bytes::copy_from_slice(body),
            },
            &mut msg,
        );
        let mut wire = BytesMut::new();
        encode_record(&msg, 1024, &mut wire).unwrap();
        let mut off = 0;
        while off < wire.len() {
            off += io.write(fd, &wire[off..]).unwrap();
        }
    }

    /// Blocking reads on a descriptor the test keeps ownership of.
    struct Borrowed<'a>(&'a Descriptors, Fd);

    impl Read for Borrowed<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(self.1, buf).map_err(Into::into)
        }
    }

    fn read_reply(io: &Descriptors, fd: Fd) -> ReplyMessage {
        let mut reader = RecordReader::new(Borrowed(io, fd));
        HeaderCodec.decode_reply(reader.read_record().unwrap()).unwrap()
    }

    #[test]
    fn blocking_recv_and_reply() {
        let io = Descriptors::in_process();
        let (sfd, cfd) = pipe_pair(&io, "conn-blocking");
        let mut conn = Connection::from_fd(&io, sfd, 0, 0).unwrap();
        let mut table = XprtTable::new();
        assert_eq!(conn.control(ControlRequest::GetSendSize).unwrap(), 9000);

        send_call(&io, cfd, 42, b"ping");
        let call = conn.recv(&mut table).unwrap();
        assert_eq!(call.xid, 42);
        assert_eq!(call.body.as_ref(), b"ping");
        assert_eq!(conn.stat(), XprtStat::Idle);

        conn.reply(b"pong").unwrap();
        let reply = read_reply(&io, cfd);
        assert_eq!(reply.xid, 42);
        assert_eq!(reply.body.as_ref(), b"pong");
    }

    #[test]
    fn second_buffered_call_reports_more_requests() {
        let io = Descriptors::in_process();
        let (sfd, cfd) = pipe_pair(&io, "conn-morereqs");
        let mut conn = Connection::from_fd(&io, sfd, 0, 0).unwrap();
        let mut table = XprtTable::new();

        let mut msgs = BytesMut::new();
        for xid in [1u32, 2] {
            let mut msg = BytesMut::new();
            HeaderCodec.encode_call(
                &CallMessage {
                    xid,
                    body: Bytes::new(),
                },
                &mut msg,
            );
            encode_record(&msg, 1024, &mut msgs).unwrap();
        }
        io.write(cfd, &msgs).unwrap();

        assert_eq!(conn.recv(&mut table).unwrap().xid, 1);
        assert_eq!(conn.stat(), XprtStat::MoreReqs);
        assert_eq!(conn.recv(&mut table).unwrap().xid, 2);
        assert_eq!(conn.stat(), XprtStat::Idle);
    }

    #[test]
    fn blocking_read_times_out_and_stays_dead() {
        let io = Descriptors::in_process();
        let (sfd, _cfd) = pipe_pair(&io, "conn-timeout");
        let config = SvcConfig {
            read_timeout_ms: 50,
            ..SvcConfig::default()
        };
        let mut conn = Connection::with_config(&io, sfd, &config).unwrap();
        let mut table = XprtTable::new();

        let started = Instant::now();
        assert!(conn.recv(&mut table).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(conn.stat(), XprtStat::Died);
        assert!(conn.diagnostic().is_some());

        assert!(conn.recv(&mut table).is_none());
        assert_eq!(conn.stat(), XprtStat::Died);
        assert!(matches!(conn.reply(b"late"), Err(SvcError::Died { .. })));
    }

    #[test]
    fn nonblocking_assembles_across_calls() {
        let io = Descriptors::in_process();
        let (sfd, cfd) = pipe_pair(&io, "conn-nonblocking");
        let mut conn = Connection::from_fd(&io, sfd, 0, 0).unwrap();
        conn.control(ControlRequest::SetConnMaxRec(4096)).unwrap();
        assert!(conn.is_nonblocking());
        let mut table = XprtTable::new();

        assert!(conn.recv(&mut table).is_none());
        assert_eq!(conn.stat(), XprtStat::Idle);

        let mut msg = BytesMut::new();
        HeaderCodec.encode_call(
            &CallMessage {
                xid: 9,
                body: Bytes::from_static(b"abcdef"),
            },
            &mut msg,
        );
        let mut wire = BytesMut::new();
        encode_record(&msg, 5, &mut wire).unwrap();
        io.write(cfd, &wire[..7]).unwrap();
        assert!(conn.recv(&mut table).is_none());
        assert_eq!(conn.stat(), XprtStat::Idle);

        io.write(cfd, &wire[7..]).unwrap();
        let call = conn.recv(&mut table).unwrap();
        assert_eq!(call.xid, 9);
        assert_eq!(call.body.as_ref(), b"abcdef");
    }

    #[test]
    fn oversized_record_kills_nonblocking_connection() {
        let io = Descriptors::in_process();
        let (sfd, cfd) = pipe_pair(&io, "conn-oversized");
        let mut conn = Connection::from_fd(&io, sfd, 0, 0).unwrap();
        conn.set_max_record(16).unwrap();
        let mut table = XprtTable::new();

        send_call(&io, cfd, 1, &[0u8; 64]);
        assert!(conn.recv(&mut table).is_none());
        assert_eq!(conn.stat(), XprtStat::Died);
    }

    #[test]
    fn malformed_header_kills_connection() {
        let io = Descriptors::in_process();
        let (sfd, cfd) = pipe_pair(&io, "conn-malformed");
        let mut conn = Connection::from_fd(&io, sfd, 0, 0).unwrap();
        let mut table = XprtTable::new();

        let mut wire = BytesMut::new();
        encode_record(b"abc", 1024, &mut wire).unwrap();
        io.write(cfd, &wire).unwrap();
        assert!(conn.recv(&mut table).is_none());
        assert_eq!(conn.stat(), XprtStat::Died);
    }

    #[test]
    fn peer_hangup_kills_connection() {
        let io = Descriptors::in_process();
        let (sfd, cfd) = pipe_pair(&io, "conn-hangup");
        let mut conn = Connection::from_fd(&io, sfd, 0, 0).unwrap();
        let mut table = XprtTable::new();
        io.close(cfd).unwrap();
        assert!(conn.recv(&mut table).is_none());
        assert_eq!(conn.stat(), XprtStat::Died);
    }

    #[test]
    fn destroy_releases_descriptor() {
        let io = Descriptors::in_process();
        let (sfd, cfd) = pipe_pair(&io, "conn-destroy");
        let conn = Box::new(Connection::from_fd(&io, sfd, 0, 0).unwrap());
        let before = io.registry().occupied();
        conn.destroy();
        assert_eq!(io.registry().occupied(), before - 1);
        assert!(io.registry().lookup(sfd).is_none());
        io.close(cfd).unwrap();
    }
}
