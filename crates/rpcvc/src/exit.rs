use std::fmt;
use std::io;

use rpcvc_record::RecordError;
use rpcvc_svc::SvcError;
use rpcvc_transport::{Errno, TransportError};

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    if err.is_programmer_error() {
        return CliError::new(INTERNAL, format!("{context}: {err}"));
    }
    let code = match err.errno() {
        Errno::Acces => PERMISSION_DENIED,
        Errno::Again => TIMEOUT,
        Errno::Inval | Errno::NameTooLong => USAGE,
        Errno::ConnRefused | Errno::NoEnt => FAILURE,
        _ => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn record_error(context: &str, err: RecordError) -> CliError {
    match err {
        RecordError::Io(source) => io_error(context, source),
        RecordError::RecordTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        RecordError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn svc_error(context: &str, err: SvcError) -> CliError {
    match err {
        SvcError::Transport(err) => transport_error(context, err),
        SvcError::Record(err) => record_error(context, err),
        SvcError::Io(err) => io_error(context, err),
        SvcError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SvcError::Decode(_) | SvcError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SvcError::Died { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
