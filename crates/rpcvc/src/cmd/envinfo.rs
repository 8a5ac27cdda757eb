use std::collections::BTreeMap;

use rpcvc_record::DEFAULT_FRAGMENT_SIZE;
use rpcvc_svc::{
    DEFAULT_LOCAL_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_TCP_SIZE, DEFAULT_WRITE_TIMEOUT,
    MAX_TRANSPORT_SIZE,
};
use rpcvc_transport::host::{
    UnixPipeHost, PIPE_BUSY_WAIT, PIPE_DIR_ENV, PIPE_PREFIX, PIPE_RECVBUF, PIPE_SENDBUF,
};
use rpcvc_transport::{FD_BASE, FD_CAPACITY, MAX_POLL_FDS};
use serde::Serialize;

use crate::cmd::EnvinfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct EnvInfoOutput {
    version: &'static str,
    target: String,
    pipe_dir: String,
    limits: BTreeMap<&'static str, String>,
    environment: BTreeMap<&'static str, Option<String>>,
}

pub fn run(_args: EnvinfoArgs, format: OutputFormat) -> CliResult<i32> {
    let environment = ["RPCVC_LOG_LEVEL", "RUST_LOG", PIPE_DIR_ENV]
        .into_iter()
        .map(|key| (key, std::env::var(key).ok()))
        .collect();

    let output = EnvInfoOutput {
        version: env!("CARGO_PKG_VERSION"),
        target: target_triple(),
        pipe_dir: UnixPipeHost::new().dir().display().to_string(),
        limits: limits(),
        environment,
    };

    print_envinfo(&output, format);
    Ok(SUCCESS)
}

fn limits() -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("fd_base", FD_BASE.to_string()),
        ("fd_capacity", FD_CAPACITY.to_string()),
        ("poll_max_fds", MAX_POLL_FDS.to_string()),
        ("pipe_prefix", PIPE_PREFIX.to_string()),
        ("pipe_sendbuf", PIPE_SENDBUF.to_string()),
        ("pipe_recvbuf", PIPE_RECVBUF.to_string()),
        ("pipe_busy_wait_ms", PIPE_BUSY_WAIT.as_millis().to_string()),
        ("fragment_size", DEFAULT_FRAGMENT_SIZE.to_string()),
        ("tcp_size", DEFAULT_TCP_SIZE.to_string()),
        ("local_size", DEFAULT_LOCAL_SIZE.to_string()),
        ("max_transport_size", MAX_TRANSPORT_SIZE.to_string()),
        ("read_timeout_ms", DEFAULT_READ_TIMEOUT.as_millis().to_string()),
        ("write_timeout_ms", DEFAULT_WRITE_TIMEOUT.as_millis().to_string()),
    ])
}

pub(crate) fn target_triple() -> String {
    option_env!("RPCVC_BUILD_TARGET").map_or_else(
        || format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
        str::to_string,
    )
}

fn print_envinfo(output: &EnvInfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("rpcvc environment\n");
            println!("  Version:    {}", output.version);
            println!("  Target:     {}", output.target);
            println!("  Pipe dir:   {}", output.pipe_dir);
            println!("\n  Limits:");
            for (k, v) in &output.limits {
                println!("    {:<20} {}", k, v);
            }
            println!("\n  Environment:");
            for (k, v) in &output.environment {
                println!("    {:<20} {}", k, v.as_deref().unwrap_or("(not set)"));
            }
        }
        OutputFormat::Raw => println!("{}", output.version),
    }
}
