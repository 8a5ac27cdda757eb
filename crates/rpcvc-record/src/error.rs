/// Errors that can occur during record encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The assembled record exceeds the configured maximum size.
    #[error("record too large ({size} bytes, max {max})")]
    RecordTooLarge { size: usize, max: usize },

    /// The requested fragment size cannot be expressed in a header.
    #[error("invalid fragment size {0}")]
    InvalidFragmentSize(usize),

    /// An I/O error occurred while reading or writing records.
    #[error("record I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete record was received.
    #[error("connection closed (incomplete record)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, RecordError>;
