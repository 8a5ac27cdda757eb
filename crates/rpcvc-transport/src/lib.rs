//! Virtual descriptor transport for ONC RPC.
//!
//! Presents a POSIX-style socket API over small integer descriptors that
//! may be backed by either a native stream socket or an emulated
//! `AF_LOCAL` endpoint built on message-mode named pipes:
//! - [`Registry`]: the fixed-capacity descriptor table
//! - [`SocketAdapter`]: verbs on native sockets
//! - [`PipeEmulator`]: verbs on pipe-backed descriptors
//! - [`Descriptors`]: dispatching facade plus `poll`/`select`
//!
//! This is the lowest layer of rpcvc. The record and service crates build
//! on the [`Descriptors`] handle provided here.

pub mod addr;
pub mod error;
pub mod fd;
pub mod host;
pub mod ready;

#[cfg(unix)]
pub mod descriptors;
#[cfg(unix)]
pub mod pipe;
#[cfg(unix)]
pub mod poll;
#[cfg(unix)]
pub mod registry;
#[cfg(unix)]
pub mod socket;
#[cfg(unix)]
pub mod stream;

pub use addr::{Domain, LocalAddr, SockAddr};
pub use error::{Errno, Result, TransportError};
pub use fd::Fd;
pub use ready::Ready;

#[cfg(unix)]
pub use descriptors::Descriptors;
#[cfg(unix)]
pub use pipe::{PeerCredentials, PipeConfig, PipeEmulator};
#[cfg(unix)]
pub use poll::{FdSet, PollFd, MAX_POLL_FDS};
#[cfg(unix)]
pub use registry::{Registry, Resource, FD_BASE, FD_CAPACITY};
#[cfg(unix)]
pub use socket::{SockOpt, SocketAdapter};
#[cfg(unix)]
pub use stream::DescriptorStream;
