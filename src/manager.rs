use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::connection::Connection;
use crate::directory::{ServiceDirectory, ServiceRecord};
use crate::error::Error;
use crate::frame;
use crate::server::ShutdownSignal;
use crate::transaction::Transaction;

/// How often every connection is probed for readable/writable progress.
const IO_SWEEP_INTERVAL: Duration = Duration::from_millis(25);
/// How often transactions are moved between connection and service queues.
const SWITCHBOARD_INTERVAL: Duration = Duration::from_millis(5);
/// Upper bound on a single socket read.
const READ_CHUNK_SIZE: usize = 4096;

type ConnectionTable = Arc<Mutex<HashMap<u64, Arc<Mutex<Connection>>>>>;

/// Supervisor for every live connection.
///
/// Two cooperative tasks share one connection table. The I/O sweep drives each
/// socket: nonblocking reads feed the frame decoder and completed payloads land on
/// the connection's inbound queue; nonblocking writes drain the outbound queue one
/// encoded frame at a time, carrying any unsent tail across sweeps. The
/// switchboard sweep moves transactions between those per-connection queues and
/// the per-service queues, in both directions.
///
/// Per connection, payloads reach the owning service in wire order and are written
/// to the wire in the order the service queued them. A close transaction is the
/// last one a service sees for a connection. Lock order is directory before
/// connection, never the reverse.
pub(crate) struct Manager {
    connections: ConnectionTable,
    directory: Arc<ServiceDirectory>,
    shutdown: Arc<ShutdownSignal>,
}

impl Manager {
    pub(crate) fn new(directory: Arc<ServiceDirectory>, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            directory,
            shutdown,
        }
    }

    pub(crate) async fn add_connection(&self, connection: Connection) {
        let id = connection.id();
        self.connections
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(connection)));
    }

    /// Spawns the I/O and switchboard tasks; both run until the shutdown signal.
    pub(crate) fn start(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let io = tokio::spawn(Self::io_loop(self.connections.clone(), self.shutdown.clone()));
        let switchboard = tokio::spawn(Self::switchboard_loop(
            self.connections.clone(),
            self.directory.clone(),
            self.shutdown.clone(),
        ));
        (io, switchboard)
    }

    /// Drops every connection, closing the underlying sockets. Called once the
    /// sweeps have stopped.
    pub(crate) async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        for (_, conn) in connections.drain() {
            conn.lock().await.close();
        }
    }

    async fn io_loop(connections: ConnectionTable, shutdown: Arc<ShutdownSignal>) {
        while !shutdown.is_set() {
            let targets: Vec<Arc<Mutex<Connection>>> =
                connections.lock().await.values().cloned().collect();
            for conn in targets {
                let mut conn = conn.lock().await;
                if !conn.is_open() {
                    if conn.needs_close_notice() {
                        debug!("connection {} closed, notifying its service", conn.id());
                        let close = Transaction::Close {
                            connection_id: conn.id(),
                        };
                        conn.enqueue_inbound(close);
                    }
                    continue;
                }
                Self::progress_read(&mut conn);
                Self::progress_write(&mut conn);
            }
            sleep(IO_SWEEP_INTERVAL).await;
        }
    }

    /// One nonblocking read, fed through the resumable decoder.
    fn progress_read(conn: &mut Connection) {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        match conn.stream.try_read(&mut buf) {
            Ok(0) => {
                // The socket was gracefully closed on the other end.
                debug!("connection {} closed by peer {}", conn.id(), conn.address());
                conn.close();
            }
            Ok(n) => {
                if let Err(err) = Self::decode_received(conn, &buf[..n]) {
                    warn!("connection {}: {err}", conn.id());
                    conn.close();
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!("connection {} read failed: {err}", conn.id());
                conn.close();
            }
        }
    }

    fn decode_received(conn: &mut Connection, bytes: &[u8]) -> Result<(), Error> {
        let mut rest = bytes;
        loop {
            rest = conn.read_progress.receive(rest)?;
            if !conn.read_progress.is_done() {
                break;
            }
            let payload = String::from_utf8(conn.read_progress.take_payload())?;
            let transaction = Transaction::Data {
                connection_id: conn.id(),
                payload,
            };
            if !conn.enqueue_inbound(transaction) {
                warn!(
                    "connection {}: inbound queue full, dropping frame; is its service draining?",
                    conn.id()
                );
            }
            if rest.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// One nonblocking write: the pending tail if there is one, otherwise the
    /// next outbound transaction.
    fn progress_write(conn: &mut Connection) {
        if let Some(tail) = conn.write_progress.take() {
            match conn.stream.try_write(&tail) {
                Ok(sent) if sent < tail.len() => {
                    conn.write_progress = Some(tail[sent..].to_vec());
                }
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    conn.write_progress = Some(tail);
                }
                Err(err) => {
                    debug!("connection {} write failed: {err}", conn.id());
                    conn.close();
                }
            }
            return;
        }
        match conn.pop_outbound() {
            Some(Transaction::Close { .. }) => {
                debug!("connection {} closed by its service", conn.id());
                conn.close();
            }
            Some(Transaction::Data { payload, .. }) => {
                let frame = frame::encode_frame(payload.as_bytes());
                match conn.stream.try_write(&frame) {
                    Ok(sent) if sent < frame.len() => {
                        conn.write_progress = Some(frame[sent..].to_vec());
                    }
                    Ok(_) => {}
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        conn.write_progress = Some(frame);
                    }
                    Err(err) => {
                        debug!("connection {} write failed: {err}", conn.id());
                        conn.close();
                    }
                }
            }
            Some(other) => {
                debug!(
                    "connection {}: discarding unexpected outbound transaction {other:?}",
                    conn.id()
                );
            }
            None => {}
        }
    }

    async fn switchboard_loop(
        connections: ConnectionTable,
        directory: Arc<ServiceDirectory>,
        shutdown: Arc<ShutdownSignal>,
    ) {
        while !shutdown.is_set() {
            let services = directory.all_services();
            Self::route_service_outbound(&connections, &services).await;
            Self::route_connection_inbound(&connections, &services).await;
            sleep(SWITCHBOARD_INTERVAL).await;
        }
    }

    /// Service outbound queues drain onto the target connections' outbound queues.
    async fn route_service_outbound(
        connections: &ConnectionTable,
        services: &[Arc<ServiceRecord>],
    ) {
        for record in services {
            while let Some(transaction) = record.try_recv_outbound() {
                let target = {
                    let table = connections.lock().await;
                    table.get(&transaction.connection_id()).cloned()
                };
                match target {
                    Some(conn) => {
                        let mut conn = conn.lock().await;
                        if !conn.enqueue_outbound(transaction) {
                            warn!(
                                "connection {}: outbound queue full, dropping transaction from {}",
                                conn.id(),
                                record.path()
                            );
                        }
                    }
                    None => debug!(
                        "service {}: transaction for unknown connection {}",
                        record.path(),
                        transaction.connection_id()
                    ),
                }
            }
        }
    }

    /// Connection inbound queues drain onto the owning services' inbound queues.
    /// A forwarded close retires the connection; traffic for a dead service is
    /// discarded and the connection closed on this pass.
    async fn route_connection_inbound(
        connections: &ConnectionTable,
        services: &[Arc<ServiceRecord>],
    ) {
        let live: HashMap<u64, &Arc<ServiceRecord>> = services
            .iter()
            .filter(|record| record.is_alive())
            .map(|record| (record.service_id(), record))
            .collect();
        let entries: Vec<(u64, Arc<Mutex<Connection>>)> = {
            let table = connections.lock().await;
            table.iter().map(|(id, conn)| (*id, conn.clone())).collect()
        };

        let mut retired = Vec::new();
        for (id, conn) in entries {
            let mut conn = conn.lock().await;
            let record = live.get(&conn.service_id());
            while let Some(transaction) = conn.pop_inbound() {
                let is_close = transaction.is_close();
                match record {
                    Some(record) => match record.try_send_inbound(transaction) {
                        Ok(()) => {}
                        Err(TrySendError::Full(returned)) if is_close => {
                            // The close must not be lost; retry it next sweep.
                            conn.push_inbound_front(returned);
                            break;
                        }
                        Err(_) => warn!(
                            "service {}: inbound queue full, dropping transaction for connection {id}",
                            record.path()
                        ),
                    },
                    None => {}
                }
                if is_close {
                    retired.push(id);
                    break;
                }
            }
            if record.is_none() && conn.is_open() {
                info!(
                    "connection {id}: service {} is gone, closing",
                    conn.service_id()
                );
                conn.close();
            }
        }

        if !retired.is_empty() {
            let mut table = connections.lock().await;
            for id in retired {
                info!("connection {id} removed");
                table.remove(&id);
            }
        }
    }
}
