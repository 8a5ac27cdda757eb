use std::fmt;

use rpcvc_transport::Fd;

use crate::codec::CallMessage;
use crate::connection::Connection;
use crate::error::Result;
use crate::table::XprtTable;

/// Which kind of transport sits on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listening endpoint that spawns connections.
    Rendezvous,
    /// One accepted or adopted connection.
    Connection,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Rendezvous => "rendezvous",
            Role::Connection => "connection",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport status after the last `recv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XprtStat {
    /// Nothing buffered.
    Idle,
    /// Another complete record is already buffered.
    MoreReqs,
    /// Unusable; destroy it.
    Died,
}

/// Transport control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Record cap (0 = unbounded, blocking).
    GetConnMaxRec,
    /// Set the record cap. On a rendezvous this applies to future connections.
    SetConnMaxRec(usize),
    GetRecvSize,
    GetSendSize,
}

/// A server-side transport bound to one descriptor.
///
/// `recv` receives the table so a rendezvous can register the connections
/// it accepts and reclaim idle ones when the descriptor table is full.
pub trait Xprt: Send + fmt::Debug {
    fn fd(&self) -> Fd;

    fn role(&self) -> Role;

    /// Pull the next call, if a complete one is available.
    fn recv(&mut self, table: &mut XprtTable) -> Option<CallMessage>;

    fn stat(&self) -> XprtStat;

    /// Send `body` as the reply to the last call received.
    fn reply(&mut self, body: &[u8]) -> Result<()>;

    fn control(&mut self, request: ControlRequest) -> Result<usize>;

    /// Close the descriptor and release the transport.
    fn destroy(self: Box<Self>);

    /// Connection view used by idle reclamation.
    fn as_connection(&self) -> Option<&Connection> {
        None
    }
}
