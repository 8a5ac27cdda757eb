//! Connection-oriented ONC RPC server transport.
//!
//! A [`Rendezvous`] sits on a listening descriptor and turns each accepted
//! client into a [`Connection`]. Both implement [`Xprt`] and live in an
//! [`XprtTable`]; a [`Server`] polls the table, hands complete calls to a
//! [`Dispatch`] handler and reclaims dead or idle connections.
//!
//! Only the transaction id and message direction are decoded here. Call
//! and reply bodies are opaque bytes.

pub mod codec;
pub mod config;
pub mod error;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod connection;
#[cfg(unix)]
pub mod rendezvous;
#[cfg(unix)]
pub mod server;
#[cfg(unix)]
pub mod table;
#[cfg(unix)]
pub mod xprt;

pub use codec::{CallMessage, HeaderCodec, MessageCodec, ReplyMessage, CALL, REPLY};
pub use config::{
    transport_size, SvcConfig, DEFAULT_LOCAL_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_TCP_SIZE,
    DEFAULT_WRITE_TIMEOUT, MAX_TRANSPORT_SIZE,
};
pub use error::{Result, SvcError};

#[cfg(unix)]
pub use client::Client;
#[cfg(unix)]
pub use connection::Connection;
#[cfg(unix)]
pub use rendezvous::Rendezvous;
#[cfg(unix)]
pub use server::{Dispatch, Server};
#[cfg(unix)]
pub use table::XprtTable;
#[cfg(unix)]
pub use xprt::{ControlRequest, Role, Xprt, XprtStat};
