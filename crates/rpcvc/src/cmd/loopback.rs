use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rpcvc_svc::{CallMessage, Client, Server, SvcConfig};
use rpcvc_transport::Descriptors;

use crate::cmd::LoopbackArgs;
use crate::exit::{svc_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{print_loopback, LoopbackReport, OutputFormat};

const TICK: Duration = Duration::from_millis(20);
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run(args: LoopbackArgs, mut config: SvcConfig, format: OutputFormat) -> CliResult<i32> {
    if let Some(max_record) = args.max_record {
        config.max_record_size = max_record;
    }
    let max_record = config.max_record_size;

    let io = Descriptors::new();
    let mut server = Server::new(io.clone(), config, |call: &CallMessage| {
        Some(call.body.clone())
    });
    let endpoint = format!("loopback-{}", std::process::id());
    let addr = server
        .listen_local(&endpoint)
        .map_err(|err| svc_error("listen failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let worker = thread::Builder::new()
        .name("rpcvc-server".to_string())
        .spawn(move || server.run(&flag, TICK))
        .map_err(|err| CliError::new(INTERNAL, format!("server thread failed: {err}")))?;

    let outcome = drive_client(&io, &addr, &args);
    running.store(false, Ordering::SeqCst);
    let served = worker
        .join()
        .map_err(|_| CliError::new(INTERNAL, "server thread panicked"))?;
    served.map_err(|err| svc_error("service loop failed", err))?;
    let (succeeded, elapsed, max_latency) = outcome?;

    let report = LoopbackReport {
        endpoint: addr.to_string(),
        calls: args.calls,
        succeeded,
        failed: args.calls - succeeded,
        payload_size: args.size,
        max_record_size: max_record,
        elapsed_ms: elapsed.as_millis(),
        max_latency_us: max_latency.as_micros(),
        descriptors_in_use: io.registry().occupied(),
    };
    print_loopback(&report, format);

    Ok(if report.failed == 0 { SUCCESS } else { FAILURE })
}

/// Make every call; returns (succeeded, total elapsed, worst latency).
fn drive_client(
    io: &Descriptors,
    addr: &rpcvc_transport::SockAddr,
    args: &LoopbackArgs,
) -> CliResult<(usize, Duration, Duration)> {
    let mut client = Client::connect(io, addr).map_err(|err| svc_error("connect failed", err))?;
    client.set_timeout(CALL_TIMEOUT);

    let started = Instant::now();
    let mut succeeded = 0;
    let mut max_latency = Duration::ZERO;
    for i in 0..args.calls {
        let payload = payload(i, args.size);
        let sent = Instant::now();
        match client.call(&payload) {
            Ok(reply) if reply.as_ref() == payload.as_slice() => succeeded += 1,
            Ok(reply) => {
                tracing::warn!(call = i, got = reply.len(), "reply does not match call");
            }
            Err(err) => {
                tracing::warn!(call = i, error = %err, "call failed");
                break;
            }
        }
        max_latency = max_latency.max(sent.elapsed());
    }
    Ok((succeeded, started.elapsed(), max_latency))
}

fn payload(index: usize, size: usize) -> Vec<u8> {
    let tag = index.to_le_bytes();
    (0..size).map(|j| tag[j % tag.len()] ^ (j as u8)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_differ_per_call() {
        assert_eq!(payload(0, 16).len(), 16);
        assert_ne!(payload(0, 16), payload(1, 16));
        assert!(payload(3, 0).is_empty());
    }
}
