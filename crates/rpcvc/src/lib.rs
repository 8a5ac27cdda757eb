//! ONC RPC transport over virtual descriptors.
//!
//! rpcvc gives native TCP sockets and pipe-emulated `AF_LOCAL` endpoints a
//! single descriptor space and a single `poll`, then runs a record-marked,
//! connection-oriented RPC server transport on top.
//!
//! # Crate Structure
//!
//! - [`transport`]: descriptor table, socket and pipe adapters, `poll`/`select`
//! - [`record`]: record marking (fragment headers, reader, writer)
//! - [`svc`]: rendezvous and connection transports, server loop, client

/// Re-export transport types.
pub mod transport {
    pub use rpcvc_transport::*;
}

/// Re-export record marking types.
pub mod record {
    pub use rpcvc_record::*;
}

/// Re-export service transport types.
pub mod svc {
    pub use rpcvc_svc::*;
}
