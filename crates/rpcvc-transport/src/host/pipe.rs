use std::sync::Arc;
use std::time::Duration;

use super::Event;

/// Outcome of an overlapped pipe operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Completed; number of bytes transferred (0 for an accept).
    Done(usize),
    /// The message was larger than the buffer, which was filled.
    MoreData(usize),
    /// Still in flight; the event fires on completion.
    Pending,
    /// A client connected before the accept was started.
    Connected,
    /// The peer end closed.
    Closed,
    /// Any other host failure.
    Failed(i32),
}

/// Why opening the client end of a pipe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// Every instance already has a client.
    Busy,
    AccessDenied,
    NotFound,
    Other(i32),
}

/// Why a pipe write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// The peer end is gone.
    Broken,
    /// The host could not take the data right now.
    Pending,
    Other(i32),
}

/// One end of a message-mode, full-duplex named pipe instance.
///
/// Dropping the value closes the end and wakes any operation the peer has
/// pending on it.
pub trait NativePipe: Send {
    /// Start waiting for a client on a server instance.
    fn start_accept(&mut self, event: &Arc<Event>) -> Completion;

    /// Start a message read into `buf`.
    fn start_read(&mut self, buf: &mut [u8], event: &Arc<Event>) -> Completion;

    /// Collect the result of the outstanding operation, blocking if `wait`.
    fn overlapped_result(&mut self, buf: &mut [u8], wait: bool) -> Completion;

    /// Write one message.
    fn write(&mut self, buf: &[u8]) -> Result<usize, WriteFault>;

    /// Process id of the connected client, on server instances.
    fn client_process_id(&self) -> Option<u32>;
}

/// Creates and opens named pipe instances.
pub trait PipeHost: Send + Sync {
    /// Create a new server instance of `name`.
    fn create_instance(&self, name: &str) -> Result<Box<dyn NativePipe>, i32>;

    /// Open the client end of a free instance of `name`.
    fn open(&self, name: &str) -> Result<Box<dyn NativePipe>, OpenError>;

    /// Wait for an instance of `name` to become free.
    fn wait_available(&self, name: &str, timeout: Duration) -> bool;
}
