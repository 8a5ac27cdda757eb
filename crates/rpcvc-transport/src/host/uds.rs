//! Named pipes backed by Unix domain sockets.
//!
//! A pipe name maps to a socket path, so descriptor tables in different
//! processes rendezvous through the filesystem. Server instances of one
//! name in this process share a single listener, and the socket file lives
//! exactly as long as the last of them.
//!
//! Accepts and reads that cannot finish at once are parked on a completion
//! thread, which sets the operation's event once the socket turns readable.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::SockRef;
use tracing::{debug, info, trace, warn};

use super::pipe::{Completion, NativePipe, OpenError, PipeHost, WriteFault};
use super::wait::{poll_native, wait_any, WaitOutcome, WaitSource};
use super::{Event, PIPE_PREFIX};
use crate::ready::Ready;

/// Environment variable naming the directory relative pipe names resolve in.
pub const PIPE_DIR_ENV: &str = "RPCVC_PIPE_DIR";

#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

const BUSY_RETRY: Duration = Duration::from_millis(10);

/// How long a write waits for the peer to drain its buffer.
const WRITE_STALL_MS: i32 = 1000;

/// Named pipe host backed by filesystem Unix domain sockets.
///
/// Relative pipe names resolve inside [`dir`](Self::dir); a name that is an
/// absolute path is used as the socket path directly.
#[derive(Debug, Clone)]
pub struct UnixPipeHost {
    dir: PathBuf,
}

impl Default for UnixPipeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixPipeHost {
    /// Default permissions for created socket files (owner read/write only).
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Host rooted at `$RPCVC_PIPE_DIR`, or `rpcvc` under the temp directory.
    pub fn new() -> Self {
        let dir = std::env::var_os(PIPE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("rpcvc"));
        Self { dir }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for a native pipe name, if it has one.
    pub fn socket_path(&self, name: &str) -> Option<PathBuf> {
        let rest = name.strip_prefix(PIPE_PREFIX)?;
        if rest.is_empty() {
            return None;
        }
        let rest = Path::new(rest);
        let path = if rest.is_absolute() {
            rest.to_path_buf()
        } else {
            self.dir.join(rest)
        };
        (path.as_os_str().len() < MAX_PATH_LEN).then_some(path)
    }
}

impl PipeHost for UnixPipeHost {
    fn create_instance(&self, name: &str) -> Result<Box<dyn NativePipe>, i32> {
        let path = self.socket_path(name).ok_or(libc::ENAMETOOLONG)?;
        let endpoint = acquire(&path).map_err(|e| {
            warn!(?path, error = %e, "could not bind pipe socket");
            os_code(&e)
        })?;
        Ok(Box::new(UdsPipeEnd {
            name: name.to_string(),
            endpoint: Some(endpoint),
            stream: None,
            op: None,
        }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn NativePipe>, OpenError> {
        let path = self
            .socket_path(name)
            .ok_or(OpenError::Other(libc::ENAMETOOLONG))?;
        let stream = UnixStream::connect(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => OpenError::NotFound,
            io::ErrorKind::PermissionDenied => OpenError::AccessDenied,
            io::ErrorKind::WouldBlock => OpenError::Busy,
            _ => OpenError::Other(os_code(&e)),
        })?;
        stream
            .set_nonblocking(true)
            .map_err(|e| OpenError::Other(os_code(&e)))?;
        debug!(?path, "pipe client connected");
        Ok(Box::new(UdsPipeEnd {
            name: name.to_string(),
            endpoint: None,
            stream: Some(stream),
            op: None,
        }))
    }

    fn wait_available(&self, name: &str, timeout: Duration) -> bool {
        thread::sleep(timeout.min(BUSY_RETRY));
        self.socket_path(name).is_some_and(|path| path.exists())
    }
}

fn os_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// A bound listener and the socket file it created.
#[derive(Debug)]
struct Endpoint {
    listener: UnixListener,
    path: PathBuf,
    inode: (u64, u64),
}

impl Endpoint {
    fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }

        // Replace a stale socket, but never a live one or a non-socket file.
        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                ));
            }
            if UnixStream::connect(path).is_ok() {
                return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        std::fs::set_permissions(
            path,
            std::fs::Permissions::from_mode(UnixPipeHost::DEFAULT_SOCKET_MODE),
        )?;
        let created = std::fs::symlink_metadata(path)?;
        info!(?path, "pipe socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            inode: (created.dev(), created.ino()),
        })
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Only remove the file this endpoint created.
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket() && (metadata.dev(), metadata.ino()) == self.inode {
                let _ = std::fs::remove_file(&self.path);
                debug!(path = ?self.path, "pipe socket removed");
            }
        }
    }
}

#[derive(Debug)]
struct Bound {
    endpoint: Arc<Endpoint>,
    instances: usize,
}

fn endpoints() -> &'static Mutex<HashMap<PathBuf, Bound>> {
    static ENDPOINTS: OnceLock<Mutex<HashMap<PathBuf, Bound>>> = OnceLock::new();
    ENDPOINTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Join the listener for `path`, binding it on first use.
fn acquire(path: &Path) -> io::Result<Arc<Endpoint>> {
    let mut map = endpoints().lock();
    if let Some(bound) = map.get_mut(path) {
        bound.instances += 1;
        return Ok(Arc::clone(&bound.endpoint));
    }
    let endpoint = Arc::new(Endpoint::bind(path)?);
    map.insert(
        path.to_path_buf(),
        Bound {
            endpoint: Arc::clone(&endpoint),
            instances: 1,
        },
    );
    Ok(endpoint)
}

/// Leave the listener; the last instance closes it under the map lock.
fn release(endpoint: Arc<Endpoint>) {
    let mut map = endpoints().lock();
    let path = endpoint.path.clone();
    drop(endpoint);
    if let Some(bound) = map.get_mut(&path) {
        bound.instances = bound.instances.saturating_sub(1);
        if bound.instances == 0 {
            map.remove(&path);
        }
    }
}

struct Watch {
    id: u64,
    fd: OwnedFd,
    event: Arc<Event>,
}

/// Completion thread for parked pipe operations.
struct Completions {
    watches: Mutex<Vec<Watch>>,
    wake: Event,
    next_id: AtomicU64,
}

fn completions() -> Option<&'static Arc<Completions>> {
    static COMPLETIONS: OnceLock<Option<Arc<Completions>>> = OnceLock::new();
    COMPLETIONS
        .get_or_init(|| match Completions::start() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "pipe completion thread unavailable");
                None
            }
        })
        .as_ref()
}

impl Completions {
    fn start() -> io::Result<Arc<Self>> {
        let this = Arc::new(Self {
            watches: Mutex::new(Vec::new()),
            wake: Event::new()?,
            next_id: AtomicU64::new(1),
        });
        let worker = Arc::clone(&this);
        thread::Builder::new()
            .name("rpcvc-pipe-io".to_string())
            .spawn(move || worker.run())?;
        Ok(this)
    }

    /// Set `event` once `fd` polls readable.
    fn watch(&self, fd: OwnedFd, event: &Arc<Event>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watches.lock().push(Watch {
            id,
            fd,
            event: Arc::clone(event),
        });
        self.wake.set();
        id
    }

    fn cancel(&self, id: u64) {
        let mut watches = self.watches.lock();
        let before = watches.len();
        watches.retain(|w| w.id != id);
        if watches.len() != before {
            self.wake.set();
        }
    }

    fn run(&self) {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut ids: Vec<u64> = Vec::new();
        loop {
            self.wake.reset();
            fds.clear();
            ids.clear();
            fds.push(libc::pollfd {
                fd: self.wake.wait_fd(),
                events: Ready::IN.to_poll_events(),
                revents: 0,
            });
            for w in self.watches.lock().iter() {
                fds.push(libc::pollfd {
                    fd: w.fd.as_raw_fd(),
                    events: Ready::IN.to_poll_events(),
                    revents: 0,
                });
                ids.push(w.id);
            }

            match poll_native(&mut fds, -1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "pipe completion poll failed");
                    thread::sleep(BUSY_RETRY);
                    continue;
                }
            }

            let fired: Vec<u64> = fds[1..]
                .iter()
                .zip(&ids)
                .filter(|(pfd, _)| pfd.revents != 0)
                .map(|(_, id)| *id)
                .collect();
            if fired.is_empty() {
                continue;
            }
            self.watches.lock().retain(|w| {
                if fired.contains(&w.id) {
                    w.event.set();
                    return false;
                }
                true
            });
            trace!(count = fired.len(), "pipe operations completed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Accept,
    Read,
}

struct Op {
    kind: OpKind,
    event: Arc<Event>,
    watch: u64,
}

/// One end of a socket-backed pipe. Server ends carry the shared listener.
struct UdsPipeEnd {
    name: String,
    endpoint: Option<Arc<Endpoint>>,
    stream: Option<UnixStream>,
    op: Option<Op>,
}

impl UdsPipeEnd {
    /// Try the operation once; `None` means it would block.
    fn attempt(&mut self, kind: OpKind, buf: &mut [u8]) -> Option<Completion> {
        match kind {
            OpKind::Accept => {
                let endpoint = self.endpoint.as_ref()?;
                match endpoint.listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            return Some(Completion::Failed(os_code(&e)));
                        }
                        self.stream = Some(stream);
                        Some(Completion::Done(0))
                    }
                    Err(e) if is_retry(&e) => None,
                    Err(e) => Some(Completion::Failed(os_code(&e))),
                }
            }
            OpKind::Read => {
                let Some(stream) = self.stream.as_mut() else {
                    return Some(Completion::Failed(libc::ENOTCONN));
                };
                match stream.read(buf) {
                    Ok(0) if !buf.is_empty() => Some(Completion::Closed),
                    Ok(n) => Some(Completion::Done(n)),
                    Err(e) if is_retry(&e) => None,
                    Err(e) if is_peer_gone(&e) => Some(Completion::Closed),
                    Err(e) => Some(Completion::Failed(os_code(&e))),
                }
            }
        }
    }

    fn watched_fd(&self, kind: OpKind) -> io::Result<OwnedFd> {
        let fd = match kind {
            OpKind::Accept => self.endpoint.as_ref().map(|ep| ep.listener.as_fd()),
            OpKind::Read => self.stream.as_ref().map(|s| s.as_fd()),
        };
        fd.ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTCONN))?
            .try_clone_to_owned()
    }

    /// Hand the operation to the completion thread.
    fn park(&mut self, kind: OpKind, event: &Arc<Event>) -> Completion {
        let Some(reactor) = completions() else {
            return Completion::Failed(libc::EIO);
        };
        event.reset();
        let fd = match self.watched_fd(kind) {
            Ok(fd) => fd,
            Err(e) => return Completion::Failed(os_code(&e)),
        };
        let watch = reactor.watch(fd, event);
        self.op = Some(Op {
            kind,
            event: Arc::clone(event),
            watch,
        });
        Completion::Pending
    }

    fn block_until_ready(&self, kind: OpKind) -> io::Result<()> {
        let fd = match kind {
            OpKind::Accept => self.endpoint.as_ref().map(|ep| ep.listener.as_raw_fd()),
            OpKind::Read => self.stream.as_ref().map(|s| s.as_raw_fd()),
        };
        let Some(fd) = fd else {
            return Err(io::Error::from_raw_os_error(libc::ENOTCONN));
        };
        let sources = [WaitSource {
            fd,
            interest: Ready::IN,
        }];
        match wait_any(&sources, -1) {
            Err(e) if e.kind() != io::ErrorKind::Interrupted => Err(e),
            _ => Ok(()),
        }
    }

    fn cancel_watch(&mut self) -> Option<Op> {
        let op = self.op.take()?;
        if let Some(reactor) = completions() {
            reactor.cancel(op.watch);
        }
        Some(op)
    }
}

fn is_retry(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

impl NativePipe for UdsPipeEnd {
    fn start_accept(&mut self, event: &Arc<Event>) -> Completion {
        if self.endpoint.is_none() {
            return Completion::Failed(libc::EINVAL);
        }
        if self.stream.is_some() {
            return Completion::Connected;
        }
        match self.attempt(OpKind::Accept, &mut []) {
            Some(Completion::Done(_)) => Completion::Connected,
            Some(other) => other,
            None => self.park(OpKind::Accept, event),
        }
    }

    fn start_read(&mut self, buf: &mut [u8], event: &Arc<Event>) -> Completion {
        match self.attempt(OpKind::Read, buf) {
            Some(done) => done,
            None => self.park(OpKind::Read, event),
        }
    }

    fn overlapped_result(&mut self, buf: &mut [u8], wait: bool) -> Completion {
        let Some(op) = self.cancel_watch() else {
            return Completion::Failed(libc::EINVAL);
        };
        loop {
            if let Some(done) = self.attempt(op.kind, buf) {
                return done;
            }
            if !wait {
                return self.park(op.kind, &op.event);
            }
            if let Err(e) = self.block_until_ready(op.kind) {
                return Completion::Failed(os_code(&e));
            }
        }
    }

    /// Send what the socket takes, waiting a bounded time for room.
    fn write(&mut self, buf: &[u8]) -> Result<usize, WriteFault> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(WriteFault::Other(libc::ENOTCONN));
        };
        let writable = [WaitSource {
            fd: stream.as_raw_fd(),
            interest: Ready::OUT,
        }];
        loop {
            match SockRef::from(stream).send_with_flags(buf, SEND_FLAGS) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match wait_any(&writable, WRITE_STALL_MS) {
                        Ok(WaitOutcome::Signaled(_)) => continue,
                        Ok(WaitOutcome::TimedOut) => return Err(WriteFault::Pending),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(WriteFault::Other(os_code(&e))),
                    }
                }
                Err(e) if is_peer_gone(&e) => return Err(WriteFault::Broken),
                Err(e) => return Err(WriteFault::Other(os_code(&e))),
            }
        }
    }

    fn client_process_id(&self) -> Option<u32> {
        self.endpoint.as_ref()?;
        peer_pid(self.stream.as_ref()?)
    }
}

impl Drop for UdsPipeEnd {
    fn drop(&mut self) {
        self.cancel_watch();
        if let Some(stream) = self.stream.take() {
            // Wake the peer even while the completion thread holds a duplicate.
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(endpoint) = self.endpoint.take() {
            release(endpoint);
        }
        trace!(pipe = %self.name, "pipe end closed");
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_pid(stream: &UnixStream) -> Option<u32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` and `len` describe a writable ucred of the stated size.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    u32::try_from(cred.pid).ok()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_pid(_stream: &UnixStream) -> Option<u32> {
    None
}
