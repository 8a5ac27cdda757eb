use std::fmt;
use std::io;

use crate::fd::Fd;

/// POSIX-style error codes surfaced by every descriptor verb.
///
/// Native platform errors are translated through a fixed table; anything
/// outside that table becomes [`TransportError::Unmapped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// `EAGAIN` / `EWOULDBLOCK`: retry later.
    Again,
    /// `EINTR`: a wait woke up without a usable readiness change.
    Intr,
    /// `EBADF`: the descriptor does not resolve to a live slot.
    BadF,
    /// `EINVAL`
    Inval,
    /// `EFAULT`: a caller-supplied address was truncated or malformed.
    Fault,
    /// `EPIPE`: the peer end of a pipe went away.
    Pipe,
    /// `EIO`
    Io,
    /// `EMFILE`: the descriptor table is full.
    MFile,
    /// `ENFILE`: the host refused to create another native object.
    NFile,
    /// `EACCES`
    Acces,
    /// `ENOENT`
    NoEnt,
    /// `ECONNREFUSED`
    ConnRefused,
    /// `ECONNRESET`
    ConnReset,
    /// `EISCONN`
    IsConn,
    /// `ENOTCONN`
    NotConn,
    /// `EADDRINUSE`
    AddrInUse,
    /// `EADDRNOTAVAIL`
    AddrNotAvail,
    /// `ENOMEM` / `ENOBUFS`
    NoMem,
    /// `ENAMETOOLONG`
    NameTooLong,
}

impl Errno {
    /// Symbolic name, e.g. `"EAGAIN"`.
    pub fn name(self) -> &'static str {
        match self {
            Errno::Again => "EAGAIN",
            Errno::Intr => "EINTR",
            Errno::BadF => "EBADF",
            Errno::Inval => "EINVAL",
            Errno::Fault => "EFAULT",
            Errno::Pipe => "EPIPE",
            Errno::Io => "EIO",
            Errno::MFile => "EMFILE",
            Errno::NFile => "ENFILE",
            Errno::Acces => "EACCES",
            Errno::NoEnt => "ENOENT",
            Errno::ConnRefused => "ECONNREFUSED",
            Errno::ConnReset => "ECONNRESET",
            Errno::IsConn => "EISCONN",
            Errno::NotConn => "ENOTCONN",
            Errno::AddrInUse => "EADDRINUSE",
            Errno::AddrNotAvail => "EADDRNOTAVAIL",
            Errno::NoMem => "ENOMEM",
            Errno::NameTooLong => "ENAMETOOLONG",
        }
    }

    /// Translate a native error code through the fixed table.
    pub fn from_raw_os_error(code: i32) -> Option<Self> {
        NATIVE_ERRNO_TABLE
            .iter()
            .find(|(native, _)| *native == code)
            .map(|(_, errno)| *errno)
    }

    fn io_kind(self) -> io::ErrorKind {
        match self {
            Errno::Again => io::ErrorKind::WouldBlock,
            Errno::Intr => io::ErrorKind::Interrupted,
            Errno::Pipe => io::ErrorKind::BrokenPipe,
            Errno::Inval | Errno::Fault | Errno::BadF => io::ErrorKind::InvalidInput,
            Errno::Acces => io::ErrorKind::PermissionDenied,
            Errno::NoEnt => io::ErrorKind::NotFound,
            Errno::ConnRefused => io::ErrorKind::ConnectionRefused,
            Errno::ConnReset => io::ErrorKind::ConnectionReset,
            Errno::NotConn => io::ErrorKind::NotConnected,
            Errno::AddrInUse => io::ErrorKind::AddrInUse,
            Errno::AddrNotAvail => io::ErrorKind::AddrNotAvailable,
            Errno::NoMem => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::Other,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(unix)]
const NATIVE_ERRNO_TABLE: &[(i32, Errno)] = &[
    (libc::EAGAIN, Errno::Again),
    (libc::EWOULDBLOCK, Errno::Again),
    (libc::EINPROGRESS, Errno::Again),
    (libc::EALREADY, Errno::Again),
    (libc::EINTR, Errno::Intr),
    (libc::EBADF, Errno::BadF),
    (libc::ENOTSOCK, Errno::BadF),
    (libc::EINVAL, Errno::Inval),
    (libc::EAFNOSUPPORT, Errno::Inval),
    (libc::EPROTONOSUPPORT, Errno::Inval),
    (libc::EOPNOTSUPP, Errno::Inval),
    (libc::EFAULT, Errno::Fault),
    (libc::EPIPE, Errno::Pipe),
    (libc::EIO, Errno::Io),
    (libc::EMFILE, Errno::MFile),
    (libc::ENFILE, Errno::NFile),
    (libc::EACCES, Errno::Acces),
    (libc::EPERM, Errno::Acces),
    (libc::ENOENT, Errno::NoEnt),
    (libc::ECONNREFUSED, Errno::ConnRefused),
    (libc::ETIMEDOUT, Errno::ConnRefused),
    (libc::EHOSTUNREACH, Errno::ConnRefused),
    (libc::ENETUNREACH, Errno::ConnRefused),
    (libc::ECONNRESET, Errno::ConnReset),
    (libc::ECONNABORTED, Errno::ConnReset),
    (libc::EISCONN, Errno::IsConn),
    (libc::ENOTCONN, Errno::NotConn),
    (libc::EADDRINUSE, Errno::AddrInUse),
    (libc::EADDRNOTAVAIL, Errno::AddrNotAvail),
    (libc::ENOMEM, Errno::NoMem),
    (libc::ENOBUFS, Errno::NoMem),
    (libc::ENAMETOOLONG, Errno::NameTooLong),
];

#[cfg(windows)]
const NATIVE_ERRNO_TABLE: &[(i32, Errno)] = {
    use windows_sys::Win32::Networking::WinSock as ws;
    &[
        (ws::WSAEWOULDBLOCK, Errno::Again),
        (ws::WSAEINPROGRESS, Errno::Again),
        (ws::WSAEALREADY, Errno::Again),
        (ws::WSAEINTR, Errno::Intr),
        (ws::WSAEBADF, Errno::BadF),
        (ws::WSAENOTSOCK, Errno::BadF),
        (ws::WSAEINVAL, Errno::Inval),
        (ws::WSAEAFNOSUPPORT, Errno::Inval),
        (ws::WSAEPROTONOSUPPORT, Errno::Inval),
        (ws::WSAEOPNOTSUPP, Errno::Inval),
        (ws::WSAEFAULT, Errno::Fault),
        (ws::WSAEMFILE, Errno::MFile),
        (ws::WSAEACCES, Errno::Acces),
        (ws::WSAECONNREFUSED, Errno::ConnRefused),
        (ws::WSAETIMEDOUT, Errno::ConnRefused),
        (ws::WSAEHOSTUNREACH, Errno::ConnRefused),
        (ws::WSAENETUNREACH, Errno::ConnRefused),
        (ws::WSAECONNRESET, Errno::ConnReset),
        (ws::WSAECONNABORTED, Errno::ConnReset),
        (ws::WSAEISCONN, Errno::IsConn),
        (ws::WSAENOTCONN, Errno::NotConn),
        (ws::WSAEADDRINUSE, Errno::AddrInUse),
        (ws::WSAEADDRNOTAVAIL, Errno::AddrNotAvail),
        (ws::WSAENOBUFS, Errno::NoMem),
        (ws::WSAENAMETOOLONG, Errno::NameTooLong),
    ]
};

#[cfg(not(any(unix, windows)))]
const NATIVE_ERRNO_TABLE: &[(i32, Errno)] = &[];

/// Errors returned by descriptor verbs.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A verb failed with a translated error code.
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },

    /// No free slot remained in the descriptor table.
    #[error("descriptor table exhausted ({capacity} slots in use)")]
    Exhausted { capacity: usize },

    /// The descriptor does not resolve to a live object.
    #[error("bad descriptor {0}")]
    BadHandle(Fd),

    /// The verb is not valid for the object's current state.
    #[error("{op} is not valid on a {state} descriptor")]
    WrongState {
        op: &'static str,
        state: &'static str,
    },

    /// The host returned an error outside the translation table.
    #[error("{op} failed with unmapped native error {code}")]
    Unmapped { op: &'static str, code: i32 },

    /// The local address path is too long for the address structure.
    #[error("local path too long ({len} bytes, max {max})")]
    PathTooLong { len: usize, max: usize },
}

impl TransportError {
    pub(crate) fn os(op: &'static str, errno: Errno) -> Self {
        TransportError::Os { op, errno }
    }

    /// Build an error from a host `io::Error`.
    pub fn from_io(op: &'static str, err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return match Errno::from_raw_os_error(code) {
                Some(errno) => TransportError::Os { op, errno },
                None => TransportError::Unmapped { op, code },
            };
        }
        let errno = match err.kind() {
            io::ErrorKind::WouldBlock => Errno::Again,
            io::ErrorKind::Interrupted => Errno::Intr,
            io::ErrorKind::BrokenPipe => Errno::Pipe,
            io::ErrorKind::InvalidInput => Errno::Inval,
            io::ErrorKind::PermissionDenied => Errno::Acces,
            io::ErrorKind::NotFound => Errno::NoEnt,
            io::ErrorKind::ConnectionRefused => Errno::ConnRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Errno::ConnReset,
            io::ErrorKind::NotConnected => Errno::NotConn,
            io::ErrorKind::AddrInUse => Errno::AddrInUse,
            io::ErrorKind::AddrNotAvailable => Errno::AddrNotAvail,
            io::ErrorKind::OutOfMemory => Errno::NoMem,
            _ => Errno::Io,
        };
        TransportError::Os { op, errno }
    }

    /// The POSIX code a C caller would see in `errno`.
    pub fn errno(&self) -> Errno {
        match self {
            TransportError::Os { errno, .. } => *errno,
            TransportError::Exhausted { .. } => Errno::MFile,
            TransportError::BadHandle(_) => Errno::BadF,
            TransportError::WrongState { .. } => Errno::Inval,
            TransportError::Unmapped { .. } => Errno::Io,
            TransportError::PathTooLong { .. } => Errno::Inval,
        }
    }

    /// `true` when retrying the same verb later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Os {
                errno: Errno::Again | Errno::Intr,
                ..
            }
        )
    }

    /// `true` for descriptor or table exhaustion.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            TransportError::Exhausted { .. }
                | TransportError::Os {
                    errno: Errno::MFile | Errno::NFile,
                    ..
                }
        )
    }

    /// `true` for errors that indicate a bug in the caller.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            TransportError::BadHandle(_)
                | TransportError::WrongState { .. }
                | TransportError::Unmapped { .. }
        )
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        io::Error::new(err.errno().io_kind(), err)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
