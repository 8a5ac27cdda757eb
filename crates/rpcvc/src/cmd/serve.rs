use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rpcvc_svc::{CallMessage, Server, SvcConfig};
use rpcvc_transport::Descriptors;

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{svc_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_listening, OutputFormat};

const TICK: Duration = Duration::from_millis(200);

pub fn run(args: ServeArgs, config: SvcConfig, format: OutputFormat) -> CliResult<i32> {
    let config = apply_overrides(config, &args)?;
    let max_record = config.max_record_size;

    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    let mut server = Server::new(Descriptors::new(), config, move |call: &CallMessage| {
        counter.fetch_add(1, Ordering::SeqCst);
        tracing::info!(xid = call.xid, size = call.body.len(), "echoing call");
        Some(call.body.clone())
    });

    let bound = match args.tcp {
        Some(addr) => server.listen_tcp(addr),
        None => server.listen_local(args.local.as_deref().unwrap_or_default()),
    }
    .map_err(|err| svc_error("listen failed", err))?;
    print_listening(&bound.to_string(), max_record, format);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        if args.count.is_some_and(|n| served.load(Ordering::SeqCst) >= n) {
            break;
        }
        server
            .run_once(Some(TICK))
            .map_err(|err| svc_error("service loop failed", err))?;
    }

    tracing::info!(calls = served.load(Ordering::SeqCst), "server stopped");
    Ok(SUCCESS)
}

fn apply_overrides(mut config: SvcConfig, args: &ServeArgs) -> CliResult<SvcConfig> {
    if let Some(max_record) = args.max_record {
        config.max_record_size = max_record;
    }
    if let Some(sendsize) = args.sendsize {
        config.sendsize = sendsize;
    }
    if let Some(recvsize) = args.recvsize {
        config.recvsize = recvsize;
    }
    if let Some(idle) = &args.idle_timeout {
        config.idle_timeout_secs = Some(whole_seconds(parse_duration(idle)?));
    }
    Ok(config)
}

/// Idle timeouts are kept in whole seconds; round up.
fn whole_seconds(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
