//! Single-threaded service loop.
//!
//! The server polls every registered descriptor, services each ready
//! transport in turn and destroys transports that died. Calls are handed to
//! a [`Dispatch`] handler whose return value becomes the reply body.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rpcvc_transport::{Descriptors, Fd, PollFd, Ready, SockAddr, MAX_POLL_FDS};
use tracing::{debug, info, warn};

use crate::codec::{CallMessage, HeaderCodec, MessageCodec};
use crate::config::SvcConfig;
use crate::error::Result;
use crate::rendezvous::Rendezvous;
use crate::table::XprtTable;
use crate::xprt::{Xprt, XprtStat};

const LISTEN_BACKLOG: i32 = 64;

/// Longest single wait on one chunk of a set too large for one poll.
const CHUNK_SLICE: Duration = Duration::from_millis(10);

/// Handles one decoded call.
///
/// Returning `None` sends no reply.
pub trait Dispatch {
    fn dispatch(&mut self, call: &CallMessage) -> Option<Bytes>;
}

impl<F> Dispatch for F
where
    F: FnMut(&CallMessage) -> Option<Bytes>,
{
    fn dispatch(&mut self, call: &CallMessage) -> Option<Bytes> {
        self(call)
    }
}

/// Transports plus the handler that serves them.
pub struct Server<D> {
    io: Descriptors,
    table: XprtTable,
    dispatch: D,
    config: SvcConfig,
    codec: Arc<dyn MessageCodec>,
}

impl<D: Dispatch> Server<D> {
    pub fn new(io: Descriptors, config: SvcConfig, dispatch: D) -> Self {
        Self {
            io,
            table: XprtTable::new(),
            dispatch,
            config,
            codec: Arc::new(HeaderCodec),
        }
    }

    /// Use `codec` for transports created from now on.
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Listen on a TCP address. Returns the bound address.
    pub fn listen_tcp(&mut self, addr: SocketAddr) -> Result<SockAddr> {
        self.listen_on(&SockAddr::Inet(addr))
    }

    /// Listen on a local (pipe) endpoint. Returns the bound address.
    pub fn listen_local(&mut self, path: &str) -> Result<SockAddr> {
        self.listen_on(&SockAddr::local(path)?)
    }

    fn listen_on(&mut self, addr: &SockAddr) -> Result<SockAddr> {
        let fd = self.io.socket(addr.domain())?;
        let bound = self
            .io
            .bind(fd, addr)
            .and_then(|()| self.io.listen(fd, LISTEN_BACKLOG))
            .and_then(|()| self.io.local_addr(fd));
        let bound = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let _ = self.io.close(fd);
                return Err(e.into());
            }
        };
        let rendezvous = match Rendezvous::create(
            &self.io,
            fd,
            self.config.sendsize,
            self.config.recvsize,
            &self.config,
        ) {
            Ok(r) => r.with_codec(Arc::clone(&self.codec)),
            Err(e) => {
                let _ = self.io.close(fd);
                return Err(e);
            }
        };
        self.register(Box::new(rendezvous));
        info!(%bound, "server listening");
        Ok(bound)
    }

    /// Add a transport to the served set.
    pub fn register(&mut self, xprt: Box<dyn Xprt>) {
        if let Some(displaced) = self.table.register(xprt) {
            tracing::error!(fd = %displaced.fd(), "descriptor already had a transport");
        }
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.io
    }

    pub fn table(&self) -> &XprtTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut XprtTable {
        &mut self.table
    }

    pub fn config(&self) -> &SvcConfig {
        &self.config
    }

    /// Wait up to `timeout` (`None` = indefinitely) and service every
    /// transport found ready. Returns how many were serviced.
    ///
    /// A poll set holds fewer than [`MAX_POLL_FDS`] descriptors. A larger
    /// table is swept chunk by chunk without waiting; while nothing is
    /// ready the server waits a short slice on each chunk in turn, so a
    /// descriptor in any chunk ends the wait.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let fds = self.table.fds();
        if fds.is_empty() {
            if let Some(timeout) = timeout {
                std::thread::sleep(timeout);
            }
            return Ok(0);
        }

        let chunks: Vec<&[Fd]> = fds.chunks(MAX_POLL_FDS - 1).collect();
        let ready = match chunks.as_slice() {
            [only] => self.poll_chunk(only, timeout)?,
            _ => self.poll_chunks(&chunks, timeout)?,
        };

        for &fd in &ready {
            self.service(fd);
        }
        if let Some(idle) = self.config.idle_timeout() {
            self.table.clean_idle(idle, self.config.clean_blocking);
        }
        Ok(ready.len())
    }

    fn poll_chunk(&self, chunk: &[Fd], wait: Option<Duration>) -> Result<Vec<Fd>> {
        let mut set: Vec<PollFd> = chunk.iter().map(|&fd| PollFd::new(fd, Ready::IN)).collect();
        match self.io.poll_timeout(&mut set, wait) {
            Ok(_) => Ok(set
                .iter()
                .filter(|p| !p.revents.is_empty())
                .map(|p| p.fd)
                .collect()),
            Err(e) if e.is_transient() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_chunks(&self, chunks: &[&[Fd]], timeout: Option<Duration>) -> Result<Vec<Fd>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut turn = 0usize;
        loop {
            let mut ready = Vec::new();
            for chunk in chunks {
                ready.extend(self.poll_chunk(chunk, Some(Duration::ZERO))?);
            }
            if !ready.is_empty() {
                return Ok(ready);
            }
            let slice = match deadline {
                None => CHUNK_SLICE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(ready);
                    }
                    left.min(CHUNK_SLICE)
                }
            };
            // Whatever this wakes on is collected by the next sweep.
            self.poll_chunk(chunks[turn % chunks.len()], Some(slice))?;
            turn = turn.wrapping_add(1);
        }
    }

    /// Serve until `running` is cleared, waking at least every `tick`.
    pub fn run(&mut self, running: &AtomicBool, tick: Duration) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            self.run_once(Some(tick))?;
        }
        debug!("server loop stopped");
        Ok(())
    }

    fn service(&mut self, fd: Fd) {
        // Out of the table while serviced, so a rendezvous can register
        // connections and reclaim others.
        let Some(mut xprt) = self.table.unregister(fd) else {
            return;
        };
        loop {
            if let Some(call) = xprt.recv(&mut self.table) {
                if let Some(body) = self.dispatch.dispatch(&call) {
                    if let Err(e) = xprt.reply(&body) {
                        debug!(%fd, xid = call.xid, error = %e, "reply not sent");
                    }
                }
            }
            if xprt.stat() != XprtStat::MoreReqs {
                break;
            }
        }
        if xprt.stat() == XprtStat::Died {
            let reason = xprt
                .as_connection()
                .and_then(|c| c.diagnostic())
                .unwrap_or_default();
            warn!(%fd, %reason, "destroying dead transport");
            xprt.destroy();
        } else {
            self.register(xprt);
        }
    }
}

impl<D> std::fmt::Debug for Server<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("transports", &self.table.len())
            .field("config", &self.config)
            .finish()
    }
}
