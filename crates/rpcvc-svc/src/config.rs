use std::path::Path;
use std::time::Duration;

use rpcvc_transport::Domain;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default buffer size for TCP transports.
pub const DEFAULT_TCP_SIZE: u32 = 64 * 1024;

/// Default buffer size for local (pipe) transports.
pub const DEFAULT_LOCAL_SIZE: u32 = 9000;

/// Largest buffer size a transport will negotiate.
pub const MAX_TRANSPORT_SIZE: u32 = 256 * 1024;

/// How long a blocking connection waits for the rest of a record.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(35);

/// How long a non-blocking connection keeps retrying a stalled write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Negotiate a transport buffer size.
///
/// Zero selects the per-domain default; anything else is capped at
/// [`MAX_TRANSPORT_SIZE`].
pub fn transport_size(domain: Domain, requested: u32) -> u32 {
    if requested == 0 {
        return match domain {
            Domain::Local => DEFAULT_LOCAL_SIZE,
            Domain::Inet | Domain::Inet6 => DEFAULT_TCP_SIZE,
        };
    }
    requested.min(MAX_TRANSPORT_SIZE)
}

/// Service transport configuration.
///
/// Every field has a default, so a JSON document only needs the keys it
/// changes:
///
/// ```
/// let config = rpcvc_svc::SvcConfig::from_json_str(r#"{"max_record_size": 4096}"#).unwrap();
/// assert_eq!(config.max_record_size, 4096);
/// assert_eq!(config.sendsize, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvcConfig {
    /// Requested send buffer size; 0 negotiates the default.
    pub sendsize: u32,
    /// Requested receive buffer size; 0 negotiates the default.
    pub recvsize: u32,
    /// Record cap for accepted connections. Non-zero makes them non-blocking.
    pub max_record_size: usize,
    /// Sweep connections idle at least this many seconds after each wake.
    pub idle_timeout_secs: Option<u64>,
    /// Whether blocking connections may be reclaimed when idle.
    pub clean_blocking: bool,
    /// Read ceiling for blocking connections, in milliseconds.
    pub read_timeout_ms: u64,
    /// Write stall ceiling, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for SvcConfig {
    fn default() -> Self {
        Self {
            sendsize: 0,
            recvsize: 0,
            max_record_size: 0,
            idle_timeout_secs: None,
            clean_blocking: false,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SvcConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
