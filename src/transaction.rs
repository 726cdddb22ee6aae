use std::net::SocketAddr;

/// The unit of message passing between connections and services.
///
/// Transactions flow through the switchboard in both directions: the manager emits
/// `NewSocket`, `Data` and `Close` toward a service's inbound queue, and a service
/// emits `Data` and `Close` toward its clients. A `Close` is terminal for its
/// connection; nothing is delivered for that connection afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    /// A client finished its handshake and is now bound to the receiving service.
    NewSocket { connection_id: u64, addr: SocketAddr },
    /// One decoded text payload.
    Data { connection_id: u64, payload: String },
    /// The peer is gone (inbound) or the service wants the socket closed (outbound).
    Close { connection_id: u64 },
}

impl Transaction {
    /// The connection this transaction belongs to.
    pub fn connection_id(&self) -> u64 {
        match self {
            Transaction::NewSocket { connection_id, .. }
            | Transaction::Data { connection_id, .. }
            | Transaction::Close { connection_id } => *connection_id,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Transaction::Close { .. })
    }
}
