use std::time::Duration;

use rpcvc_transport::Fd;

/// Errors that can occur in service transport operations.
#[derive(Debug, thiserror::Error)]
pub enum SvcError {
    /// Descriptor-level error.
    #[error("transport error: {0}")]
    Transport(#[from] rpcvc_transport::TransportError),

    /// Record marking error.
    #[error("record error: {0}")]
    Record(#[from] rpcvc_record::RecordError),

    /// A record did not carry a well-formed message header.
    #[error("malformed message: {0}")]
    Decode(String),

    /// The connection died and can only be destroyed.
    #[error("connection {fd} died: {}", .reason.as_deref().unwrap_or("no diagnostic"))]
    Died { fd: Fd, reason: Option<String> },

    /// The verb has no meaning for this kind of transport.
    #[error("{op} is not supported on a {role} transport")]
    Unsupported {
        op: &'static str,
        role: &'static str,
    },

    /// Call timed out waiting for its reply.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SvcError>;
