use std::fs;
use std::time::Instant;

use rpcvc_svc::Client;
use rpcvc_transport::{Descriptors, SockAddr};

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{io_error, svc_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;

    let addr = match (&args.tcp, &args.local) {
        (Some(tcp), _) => SockAddr::Inet(*tcp),
        (None, local) => SockAddr::local(local.as_deref().unwrap_or_default())
            .map_err(|err| transport_error("invalid local endpoint", err))?,
    };

    let io = Descriptors::new();
    let mut client =
        Client::connect(&io, &addr).map_err(|err| svc_error("connect failed", err))?;
    client.set_timeout(timeout);

    let started = Instant::now();
    let reply = client
        .call_with_xid(args.xid, &payload)
        .map_err(|err| svc_error("call failed", err))?;
    print_reply(args.xid, &reply, started.elapsed(), format);

    Ok(SUCCESS)
}

fn resolve_payload(args: &CallArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
