use rpcvc_transport::{FD_BASE, FD_CAPACITY, MAX_POLL_FDS};

use crate::cmd::envinfo::target_triple;
use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("rpcvc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: rpcvc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target: {}", target_triple());
    println!(
        "descriptors: base={} capacity={} poll_max={}",
        FD_BASE, FD_CAPACITY, MAX_POLL_FDS
    );

    Ok(SUCCESS)
}
