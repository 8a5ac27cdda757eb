use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RecordError, Result};

/// Fragment header: one big-endian u32.
pub const HEADER_SIZE: usize = 4;

/// Header bit marking the last fragment of a record.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Largest length a fragment header can carry.
pub const MAX_FRAGMENT_SIZE: usize = 0x7fff_ffff;

/// Default fragment payload size: a 64 KiB send buffer minus the header.
pub const DEFAULT_FRAGMENT_SIZE: usize = 64 * 1024 - HEADER_SIZE;

const DEFAULT_READ_CHUNK: usize = 8 * 1024;

/// Encode `payload` as one record.
///
/// Wire format, repeated per fragment:
/// ```text
/// ┌─┬──────────────────────────────┬──────────────────┐
/// │L│ Length (31 bits, BE)         │ Payload          │
/// └─┴──────────────────────────────┴──────────────────┘
/// ```
/// `L` is set on the final fragment. An empty payload is a single empty
/// last fragment.
pub fn encode_record(payload: &[u8], fragment_size: usize, dst: &mut BytesMut) -> Result<()> {
    if fragment_size == 0 || fragment_size > MAX_FRAGMENT_SIZE {
        return Err(RecordError::InvalidFragmentSize(fragment_size));
    }
    let fragments = payload.len().div_ceil(fragment_size).max(1);
    dst.reserve(fragments * HEADER_SIZE + payload.len());
    if payload.is_empty() {
        dst.put_u32(LAST_FRAGMENT);
        return Ok(());
    }
    let mut chunks = payload.chunks(fragment_size).peekable();
    while let Some(chunk) = chunks.next() {
        let mut header = chunk.len() as u32;
        if chunks.peek().is_none() {
            header |= LAST_FRAGMENT;
        }
        dst.put_u32(header);
        dst.put_slice(chunk);
    }
    Ok(())
}

/// Move complete fragments from `src` into `partial` until a record ends.
///
/// Returns `Ok(None)` if `src` runs out first; the fragments consumed so
/// far stay in `partial` for the next call. `max_record` of zero means
/// unbounded.
pub fn decode_record(
    src: &mut BytesMut,
    partial: &mut BytesMut,
    max_record: usize,
) -> Result<Option<Bytes>> {
    loop {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = (header & !LAST_FRAGMENT) as usize;
        let last = header & LAST_FRAGMENT != 0;

        let size = partial.len() + len;
        if max_record != 0 && size > max_record {
            return Err(RecordError::RecordTooLarge {
                size,
                max: max_record,
            });
        }
        if src.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        partial.extend_from_slice(&src.split_to(len));
        if last {
            return Ok(Some(partial.split().freeze()));
        }
    }
}

/// Whether `src` already holds every fragment of at least one record.
pub fn record_ready(src: &[u8]) -> bool {
    let mut offset = 0;
    loop {
        let Some(header) = src.get(offset..offset + HEADER_SIZE) else {
            return false;
        };
        let header = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let end = offset + HEADER_SIZE + (header & !LAST_FRAGMENT) as usize;
        if src.len() < end {
            return false;
        }
        if header & LAST_FRAGMENT != 0 {
            return true;
        }
        offset = end;
    }
}

/// Configuration for record readers and writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordConfig {
    /// Maximum assembled record size in bytes. Zero means unbounded.
    pub max_record_size: usize,
    /// Payload bytes per outgoing fragment.
    pub fragment_size: usize,
    /// Bytes requested from the stream per read.
    pub read_chunk: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            max_record_size: 0,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(wire: &[u8], max: usize) -> Result<Option<Bytes>> {
        let mut src = BytesMut::from(wire);
        let mut partial = BytesMut::new();
        decode_record(&mut src, &mut partial, max)
    }

    #[test]
    fn single_fragment_header_has_last_bit() {
        let mut wire = BytesMut::new();
        encode_record(b"abc", 16, &mut wire).unwrap();
        assert_eq!(&wire[..4], &[0x80, 0, 0, 3]);
        assert_eq!(&wire[4..], b"abc");
    }

    #[test]
    fn payload_splits_into_fragments() {
        let mut wire = BytesMut::new();
        encode_record(b"abcdefgh", 3, &mut wire).unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 3]);
        assert_eq!(&wire[7..11], &[0, 0, 0, 3]);
        assert_eq!(&wire[14..18], &[0x80, 0, 0, 2]);
        assert_eq!(decode_all(&wire, 0).unwrap().unwrap().as_ref(), b"abcdefgh");
    }

    #[test]
    fn empty_record_is_one_last_fragment() {
        let mut wire = BytesMut::new();
        encode_record(b"", 16, &mut wire).unwrap();
        assert_eq!(wire.as_ref(), &[0x80, 0, 0, 0]);
        assert!(decode_all(&wire, 0).unwrap().unwrap().is_empty());
    }

    #[test]
    fn incomplete_record_keeps_consumed_fragments() {
        let mut wire = BytesMut::new();
        encode_record(b"abcdef", 3, &mut wire).unwrap();
        let mut src = BytesMut::from(&wire[..9]);
        let mut partial = BytesMut::new();
        assert!(decode_record(&mut src, &mut partial, 0).unwrap().is_none());
        assert_eq!(partial.as_ref(), b"abc");
        src.extend_from_slice(&wire[9..]);
        let record = decode_record(&mut src, &mut partial, 0).unwrap().unwrap();
        assert_eq!(record.as_ref(), b"abcdef");
        assert!(src.is_empty());
    }

    #[test]
    fn oversized_record_is_rejected_from_header() {
        let wire = [0x80, 0, 0x10, 0];
        assert!(matches!(
            decode_all(&wire, 1024),
            Err(RecordError::RecordTooLarge { size: 4096, max: 1024 })
        ));
    }

    #[test]
    fn zero_fragment_size_is_invalid() {
        let mut wire = BytesMut::new();
        assert!(matches!(
            encode_record(b"x", 0, &mut wire),
            Err(RecordError::InvalidFragmentSize(0))
        ));
    }

    #[test]
    fn record_ready_requires_last_fragment() {
        let mut wire = BytesMut::new();
        encode_record(b"abcdef", 3, &mut wire).unwrap();
        assert!(!record_ready(&wire[..7]));
        assert!(!record_ready(&wire[..12]));
        assert!(record_ready(&wire));
        assert!(!record_ready(&[]));
    }
}
