use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgGroup, Args, Subcommand};
use rpcvc_svc::SvcConfig;

use crate::exit::{svc_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod envinfo;
pub mod loopback;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an echo RPC service.
    Serve(ServeArgs),
    /// Make one call and print the reply.
    Call(CallArgs),
    /// Run an in-process server and client over a local endpoint.
    Loopback(LoopbackArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Print build and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, load_config(config)?, format),
        Command::Call(args) => call::run(args, format),
        Command::Loopback(args) => loopback::run(args, load_config(config)?, format),
        Command::Version(args) => version::run(args),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("endpoint").required(true).args(["tcp", "local"])))]
pub struct ServeArgs {
    /// TCP address to listen on (port 0 picks one).
    #[arg(long, value_name = "ADDR")]
    pub tcp: Option<SocketAddr>,
    /// Local endpoint name, a socket under $RPCVC_PIPE_DIR or an absolute path.
    #[arg(long, value_name = "NAME")]
    pub local: Option<String>,
    /// Record cap for accepted connections; non-zero makes them non-blocking.
    #[arg(long, value_name = "BYTES")]
    pub max_record: Option<usize>,
    /// Reclaim connections idle this long (e.g. 30s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub idle_timeout: Option<String>,
    /// Requested send buffer size.
    #[arg(long, value_name = "BYTES")]
    pub sendsize: Option<u32>,
    /// Requested receive buffer size.
    #[arg(long, value_name = "BYTES")]
    pub recvsize: Option<u32>,
    /// Exit after serving N calls.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("endpoint").required(true).args(["tcp", "local"])))]
pub struct CallArgs {
    /// TCP address of the service.
    #[arg(long, value_name = "ADDR")]
    pub tcp: Option<SocketAddr>,
    /// Local endpoint name the service listens on.
    #[arg(long, value_name = "NAME")]
    pub local: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Transaction id to use.
    #[arg(long, default_value = "1")]
    pub xid: u32,
    /// Maximum time to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Number of calls to make.
    #[arg(long, default_value = "16")]
    pub calls: usize,
    /// Payload bytes per call.
    #[arg(long, default_value = "64")]
    pub size: usize,
    /// Record cap for the server's connections.
    #[arg(long, value_name = "BYTES")]
    pub max_record: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}

fn load_config(path: Option<&Path>) -> CliResult<SvcConfig> {
    match path {
        Some(path) => SvcConfig::from_json_file(path)
            .map_err(|err| svc_error(&format!("failed loading {}", path.display()), err)),
        None => Ok(SvcConfig::default()),
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Some(Path::new("/nonexistent/rpcvc.json"))).unwrap_err();
        assert!(err.message.contains("failed loading"));
    }
}
