use std::io::{self, Read, Write};
use std::time::Duration;

use crate::addr::SockAddr;
use crate::descriptors::Descriptors;
use crate::error::{Errno, Result};
use crate::poll::PollFd;
use crate::ready::Ready;
use crate::registry::Fd;

/// A connected virtual descriptor implementing Read + Write.
///
/// Reads wait for readiness through the multiplexer, so an optional read
/// timeout applies to sockets and pipes alike. Dropping the stream closes
/// the descriptor.
#[derive(Debug)]
pub struct DescriptorStream {
    io: Descriptors,
    fd: Fd,
    read_timeout: Option<Duration>,
}

impl DescriptorStream {
    /// Wrap an already-connected descriptor.
    pub fn from_fd(io: Descriptors, fd: Fd) -> Self {
        Self {
            io,
            fd,
            read_timeout: None,
        }
    }

    /// Create a descriptor in the address's domain and connect it.
    pub fn connect(io: &Descriptors, addr: &SockAddr) -> Result<Self> {
        let fd = io.socket(addr.domain())?;
        if let Err(e) = io.connect(fd, addr) {
            let _ = io.close(fd);
            return Err(e);
        }
        Ok(Self::from_fd(io.clone(), fd))
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    /// Set read timeout; `None` blocks indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    fn wait_readable(&self) -> io::Result<()> {
        let Some(timeout) = self.read_timeout else {
            return Ok(());
        };
        loop {
            let mut fds = [PollFd::new(self.fd, Ready::IN)];
            match self.io.poll_timeout(&mut fds, Some(timeout)) {
                Ok(0) => return Err(io::ErrorKind::TimedOut.into()),
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Read for DescriptorStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait_readable()?;
        match self.io.read(self.fd, buf) {
            Ok(n) => Ok(n),
            // A hung-up pipe reports EPIPE once; surface it as end-of-stream.
            Err(e) if e.errno() == Errno::Pipe => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl Write for DescriptorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.write(self.fd, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DescriptorStream {
    fn drop(&mut self) {
        let _ = self.io.close(self.fd);
    }
}
