//! ONC RPC record marking over byte streams.
//!
//! A record is sent as one or more fragments. Each fragment carries:
//! - A 4-byte big-endian header whose low 31 bits are the fragment length
//! - The high header bit, set on the last fragment of a record
//!
//! [`RecordReader`] reassembles records either blocking or in a
//! non-blocking mode that keeps partial input buffered between calls.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_record, encode_record, record_ready, RecordConfig, DEFAULT_FRAGMENT_SIZE, HEADER_SIZE,
    LAST_FRAGMENT, MAX_FRAGMENT_SIZE,
};
pub use error::{RecordError, Result};
pub use reader::RecordReader;
pub use writer::RecordWriter;
