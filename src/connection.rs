use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;

use crate::frame::FrameDecoder;
use crate::transaction::Transaction;

/// Capacity of the per-connection inbound and outbound queues. On overflow the
/// newest data frame is dropped; close transactions always fit.
pub(crate) const QUEUE_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// One admitted, upgraded WebSocket session, bound to a single service for its
/// lifetime.
///
/// All fields are owned by the manager and mutated under the per-connection lock:
/// the I/O sweep advances the read and write progress, the switchboard sweep moves
/// transactions between the queues and the owning service. Ids are process-unique
/// and never reused.
pub(crate) struct Connection {
    id: u64,
    addr: SocketAddr,
    service_id: u64,
    pub(crate) stream: TcpStream,
    open: bool,
    close_enqueued: bool,
    pub(crate) read_progress: FrameDecoder,
    /// Unsent tail of the frame currently being written, if any. A connection
    /// serializes one outbound frame at a time.
    pub(crate) write_progress: Option<Vec<u8>>,
    inbound: VecDeque<Transaction>,
    outbound: VecDeque<Transaction>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, addr: SocketAddr, service_id: u64) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            service_id,
            stream,
            open: true,
            close_enqueued: false,
            read_progress: FrameDecoder::new(),
            write_progress: None,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn service_id(&self) -> u64 {
        self.service_id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    /// Marks the connection closed and discards everything still pending toward
    /// the peer. Idempotent. The TCP stream itself closes when the connection is
    /// dropped from the manager's table.
    pub(crate) fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.write_progress = None;
        self.outbound.clear();
    }

    /// True exactly once, when the closed connection still owes its service a
    /// synthetic close notice.
    pub(crate) fn needs_close_notice(&mut self) -> bool {
        if self.open || self.close_enqueued {
            return false;
        }
        self.close_enqueued = true;
        true
    }

    /// Queues a transaction heading to the owning service. Returns false when the
    /// queue is full and the transaction was dropped; close transactions are
    /// always accepted so peer loss cannot go unnoticed.
    pub(crate) fn enqueue_inbound(&mut self, transaction: Transaction) -> bool {
        if self.inbound.len() >= QUEUE_CAPACITY && !transaction.is_close() {
            return false;
        }
        self.inbound.push_back(transaction);
        true
    }

    pub(crate) fn pop_inbound(&mut self) -> Option<Transaction> {
        self.inbound.pop_front()
    }

    /// Puts a transaction back at the head of the inbound queue, for the
    /// switchboard to retry on its next sweep.
    pub(crate) fn push_inbound_front(&mut self, transaction: Transaction) {
        self.inbound.push_front(transaction);
    }

    /// Queues a transaction from the service toward the peer. Returns false when
    /// the queue is full and the transaction was dropped.
    pub(crate) fn enqueue_outbound(&mut self, transaction: Transaction) -> bool {
        if self.outbound.len() >= QUEUE_CAPACITY && !transaction.is_close() {
            return false;
        }
        self.outbound.push_back(transaction);
        true
    }

    pub(crate) fn pop_outbound(&mut self) -> Option<Transaction> {
        self.outbound.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn test_connection() -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        Connection::new(stream, addr, 7)
    }

    #[tokio::test]
    async fn ids_are_unique_and_monotonic() {
        let a = test_connection().await;
        let b = test_connection().await;
        assert!(b.id() > a.id());
        assert_eq!(a.service_id(), 7);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_discards_output() {
        let mut conn = test_connection().await;
        conn.enqueue_outbound(Transaction::Data {
            connection_id: conn.id(),
            payload: "pending".into(),
        });
        conn.close();
        conn.close();
        assert!(!conn.is_open());
        assert!(conn.pop_outbound().is_none());
    }

    #[tokio::test]
    async fn close_notice_fires_exactly_once() {
        let mut conn = test_connection().await;
        assert!(!conn.needs_close_notice());
        conn.close();
        assert!(conn.needs_close_notice());
        assert!(!conn.needs_close_notice());
    }

    #[tokio::test]
    async fn full_inbound_queue_drops_data_but_not_close() {
        let mut conn = test_connection().await;
        let id = conn.id();
        for _ in 0..QUEUE_CAPACITY {
            assert!(conn.enqueue_inbound(Transaction::Data {
                connection_id: id,
                payload: "x".into(),
            }));
        }
        assert!(!conn.enqueue_inbound(Transaction::Data {
            connection_id: id,
            payload: "overflow".into(),
        }));
        assert!(conn.enqueue_inbound(Transaction::Close { connection_id: id }));
    }
}
