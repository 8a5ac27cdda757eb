use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::codec::{decode_record, record_ready, RecordConfig};
use crate::error::{RecordError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete records from any `Read` stream.
///
/// Handles fragment reassembly internally. In non-blocking use the inner
/// stream reports `WouldBlock` and [`poll_record`](Self::poll_record)
/// returns `Ok(None)` with the partial record kept for the next call.
#[derive(Debug)]
pub struct RecordReader<T> {
    inner: T,
    buf: BytesMut,
    partial: BytesMut,
    config: RecordConfig,
}

impl<T: Read> RecordReader<T> {
    /// Create a new record reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, RecordConfig::default())
    }

    /// Create a new record reader with explicit configuration.
    pub fn with_config(inner: T, config: RecordConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            partial: BytesMut::new(),
            config,
        }
    }

    /// Read the next complete record (blocking).
    ///
    /// Returns `Err(RecordError::ConnectionClosed)` when EOF is reached.
    pub fn read_record(&mut self) -> Result<Bytes> {
        loop {
            if let Some(record) = self.decode()? {
                return Ok(record);
            }
            self.fill()?;
        }
    }

    /// Try to assemble the next record without blocking.
    ///
    /// Returns `Ok(None)` once the stream would block.
    pub fn poll_record(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(record) = self.decode()? {
                return Ok(Some(record));
            }
            match self.fill() {
                Ok(()) => {}
                Err(RecordError::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(None)
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn decode(&mut self) -> Result<Option<Bytes>> {
        let record = decode_record(&mut self.buf, &mut self.partial, self.config.max_record_size)?;
        if let Some(record) = &record {
            trace!(len = record.len(), "record assembled");
        }
        Ok(record)
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; self.config.read_chunk.max(1)];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(RecordError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(RecordError::Io(err)),
            }
        }
    }

    /// Whether a whole record is already buffered.
    pub fn has_buffered_record(&self) -> bool {
        record_ready(&self.buf)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum record size for subsequent decoding.
    pub fn set_max_record_size(&mut self, max_record_size: usize) {
        self.config.max_record_size = max_record_size;
    }

    /// Update bytes requested per read.
    pub fn set_read_chunk(&mut self, read_chunk: usize) {
        self.config.read_chunk = read_chunk;
    }

    /// Current record reader configuration.
    pub fn config(&self) -> &RecordConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{self, Cursor};

    use super::*;
    use crate::codec::encode_record;

    /// Yields scripted chunks, then `WouldBlock` until more are pushed.
    struct Scripted {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                chunks: VecDeque::new(),
            }
        }

        fn push(&mut self, bytes: &[u8]) {
            self.chunks.push_back(Ok(bytes.to_vec()));
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                None => Err(ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.chunks.push_front(Ok(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    fn wire(records: &[&[u8]], fragment: usize) -> Vec<u8> {
        let mut out = BytesMut::new();
        for r in records {
            encode_record(r, fragment, &mut out).unwrap();
        }
        out.to_vec()
    }

    #[test]
    fn read_multiple_records() {
        let mut reader = RecordReader::new(Cursor::new(wire(&[b"one", b"two", b"three"], 2)));
        assert_eq!(reader.read_record().unwrap().as_ref(), b"one");
        assert_eq!(reader.read_record().unwrap().as_ref(), b"two");
        assert_eq!(reader.read_record().unwrap().as_ref(), b"three");
        assert!(matches!(reader.read_record(), Err(RecordError::ConnectionClosed)));
    }

    #[test]
    fn poll_record_resumes_after_would_block() {
        let bytes = wire(&[b"hello world"], 4);
        let mut stream = Scripted::new();
        stream.push(&bytes[..6]);
        let mut reader = RecordReader::new(stream);
        assert!(reader.poll_record().unwrap().is_none());

        reader.get_mut().push(&bytes[6..]);
        assert_eq!(reader.poll_record().unwrap().unwrap().as_ref(), b"hello world");
        assert!(reader.poll_record().unwrap().is_none());
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let bytes = wire(&[b"x"], 16);
        let mut stream = Scripted::new();
        stream
            .chunks
            .push_back(Err(io::Error::from(ErrorKind::Interrupted)));
        stream.push(&bytes);
        let mut reader = RecordReader::new(stream);
        assert_eq!(reader.poll_record().unwrap().unwrap().as_ref(), b"x");
    }

    #[test]
    fn buffered_record_is_reported() {
        let mut stream = Scripted::new();
        stream.push(&wire(&[b"a", b"b"], 16));
        let mut reader = RecordReader::new(stream);
        assert!(!reader.has_buffered_record());
        assert_eq!(reader.poll_record().unwrap().unwrap().as_ref(), b"a");
        assert!(reader.has_buffered_record());
        assert_eq!(reader.poll_record().unwrap().unwrap().as_ref(), b"b");
        assert!(!reader.has_buffered_record());
    }

    #[test]
    fn max_record_size_applies_across_fragments() {
        let mut reader = RecordReader::new(Cursor::new(wire(&[b"abcdefgh"], 3)));
        reader.set_max_record_size(5);
        assert!(matches!(
            reader.read_record(),
            Err(RecordError::RecordTooLarge { max: 5, .. })
        ));
    }

    #[test]
    fn eof_mid_record_is_connection_closed() {
        let bytes = wire(&[b"abcdef"], 16);
        let mut reader = RecordReader::new(Cursor::new(bytes[..5].to_vec()));
        assert!(matches!(reader.read_record(), Err(RecordError::ConnectionClosed)));
    }
}
