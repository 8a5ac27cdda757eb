//! Host primitives the emulation layers are built from.
//!
//! The pipe emulator only talks to the host through [`PipeHost`] and
//! [`NativePipe`], so a different named-pipe implementation can be
//! plugged in without touching the registry or the poll multiplexer.
//! [`UnixPipeHost`] maps pipe names onto filesystem sockets and is the
//! default; [`LocalPipeHost`] keeps the namespace inside one process.

use std::time::Duration;

/// Namespace prefix for native pipe names.
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// Per-instance outbound buffer size.
pub const PIPE_SENDBUF: usize = 32 * 1024;

/// Per-instance inbound buffer size, also the pipe read buffer size.
pub const PIPE_RECVBUF: usize = 16 * 1044;

/// Default wait for a busy pipe to become available.
pub const PIPE_BUSY_WAIT: Duration = Duration::from_millis(500);

#[cfg(unix)]
mod event;
#[cfg(unix)]
mod local;
#[cfg(unix)]
mod pipe;
#[cfg(unix)]
mod uds;
#[cfg(unix)]
pub(crate) mod wait;

#[cfg(unix)]
pub use event::Event;
#[cfg(unix)]
pub use local::LocalPipeHost;
#[cfg(unix)]
pub use pipe::{Completion, NativePipe, OpenError, PipeHost, WriteFault};
#[cfg(unix)]
pub use uds::{UnixPipeHost, PIPE_DIR_ENV};
