//! Echo service over TCP.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- call --tcp 127.0.0.1:7070 --data hello

use std::net::SocketAddr;
use std::time::Duration;

use rpcvc::svc::{CallMessage, Server, SvcConfig};
use rpcvc::transport::Descriptors;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SvcConfig {
        idle_timeout_secs: Some(60),
        ..SvcConfig::default()
    };
    let mut server = Server::new(Descriptors::new(), config, |call: &CallMessage| {
        eprintln!("call xid={} size={}", call.xid, call.body.len());
        Some(call.body.clone())
    });

    let addr: SocketAddr = "127.0.0.1:7070".parse()?;
    let bound = server.listen_tcp(addr)?;
    eprintln!("Listening on {bound}");

    loop {
        server.run_once(Some(Duration::from_secs(1)))?;
    }
}
