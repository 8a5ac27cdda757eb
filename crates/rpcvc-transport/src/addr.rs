//! Socket addresses for the three supported domains.
//!
//! `AF_LOCAL` addresses are carried in a `sockaddr_un`-shaped structure:
//! a family tag, an explicit length byte and a NUL-terminated path of at
//! most [`LOCAL_PATH_MAX`] bytes.

use std::fmt;
use std::net::SocketAddr;

use crate::error::{Errno, Result, TransportError};
use crate::host::PIPE_PREFIX;

/// Family tag used for local addresses on the wire.
pub const AF_LOCAL: u16 = 99;

/// Longest local path, excluding the terminating NUL.
pub const LOCAL_PATH_MAX: usize = 107;

/// Size of the encoded address: family (2) + length (1) + path (108).
pub const LOCAL_ADDR_LEN: usize = 2 + 1 + LOCAL_PATH_MAX + 1;

/// Socket domain requested at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Inet,
    Inet6,
    Local,
}

/// A validated `AF_LOCAL` address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LocalAddr {
    path: String,
}

impl LocalAddr {
    /// Validate a path for use as a local address.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() || path.contains('\0') {
            return Err(TransportError::os("bind", Errno::Inval));
        }
        if path.len() > LOCAL_PATH_MAX {
            return Err(TransportError::PathTooLong {
                len: path.len(),
                max: LOCAL_PATH_MAX,
            });
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Native pipe name this address maps to.
    pub fn pipe_name(&self) -> String {
        format!("{PIPE_PREFIX}{}", self.path)
    }

    /// Encode into the fixed-size wire structure.
    pub fn to_bytes(&self) -> [u8; LOCAL_ADDR_LEN] {
        let mut out = [0u8; LOCAL_ADDR_LEN];
        out[..2].copy_from_slice(&AF_LOCAL.to_le_bytes());
        // Length counts the terminating NUL.
        out[2] = (self.path.len() + 1) as u8;
        out[3..3 + self.path.len()].copy_from_slice(self.path.as_bytes());
        out
    }

    /// Decode a caller-supplied address structure.
    ///
    /// A buffer shorter than the header is a fault; a wrong family or an
    /// inconsistent length is an invalid argument.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 3 {
            return Err(TransportError::os("bind", Errno::Fault));
        }
        let family = u16::from_le_bytes([raw[0], raw[1]]);
        if family != AF_LOCAL {
            return Err(TransportError::os("bind", Errno::Inval));
        }
        let len = raw[2] as usize;
        if len < 2 || len > LOCAL_PATH_MAX + 1 {
            return Err(TransportError::os("bind", Errno::Inval));
        }
        let body = raw
            .get(3..3 + len)
            .ok_or_else(|| TransportError::os("bind", Errno::Fault))?;
        let path_bytes = match body.iter().position(|b| *b == 0) {
            Some(nul) => &body[..nul],
            None => return Err(TransportError::os("bind", Errno::Inval)),
        };
        let path = std::str::from_utf8(path_bytes)
            .map_err(|_| TransportError::os("bind", Errno::Inval))?;
        Self::new(path)
    }
}

impl fmt::Debug for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LocalAddr").field(&self.path).finish()
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Any address a descriptor can be bound or connected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SockAddr {
    Inet(SocketAddr),
    Local(LocalAddr),
}

impl SockAddr {
    /// Convenience constructor for a local address.
    pub fn local(path: impl Into<String>) -> Result<Self> {
        LocalAddr::new(path).map(SockAddr::Local)
    }

    pub fn domain(&self) -> Domain {
        match self {
            SockAddr::Inet(SocketAddr::V4(_)) => Domain::Inet,
            SockAddr::Inet(SocketAddr::V6(_)) => Domain::Inet6,
            SockAddr::Local(_) => Domain::Local,
        }
    }

    pub fn as_inet(&self) -> Option<&SocketAddr> {
        match self {
            SockAddr::Inet(addr) => Some(addr),
            SockAddr::Local(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&LocalAddr> {
        match self {
            SockAddr::Local(addr) => Some(addr),
            SockAddr::Inet(_) => None,
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        SockAddr::Inet(addr)
    }
}

impl From<LocalAddr> for SockAddr {
    fn from(addr: LocalAddr) -> Self {
        SockAddr::Local(addr)
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Inet(addr) => write!(f, "{addr}"),
            SockAddr::Local(addr) => write!(f, "local:{addr}"),
        }
    }
}
