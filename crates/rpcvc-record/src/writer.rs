use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_record, RecordConfig};
use crate::error::{RecordError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete records to any `Write` stream.
#[derive(Debug)]
pub struct RecordWriter<T> {
    inner: T,
    buf: BytesMut,
    config: RecordConfig,
}

impl<T: Write> RecordWriter<T> {
    /// Create a new record writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, RecordConfig::default())
    }

    /// Create a new record writer with explicit configuration.
    pub fn with_config(inner: T, config: RecordConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and send `payload` as one record, then flush.
    pub fn send_record(&mut self, payload: &[u8]) -> Result<()> {
        if self.config.max_record_size != 0 && payload.len() > self.config.max_record_size {
            return Err(RecordError::RecordTooLarge {
                size: payload.len(),
                max: self.config.max_record_size,
            });
        }

        self.buf.clear();
        encode_record(payload, self.config.fragment_size, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(RecordError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(RecordError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(RecordError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update payload bytes per fragment.
    pub fn set_fragment_size(&mut self, fragment_size: usize) {
        self.config.fragment_size = fragment_size;
    }

    /// Current record writer configuration.
    pub fn config(&self) -> &RecordConfig {
        &self.config
    }
}
