use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::directory::ServiceDirectory;
use crate::error::Error;
use crate::handshake;
use crate::manager::Manager;
use crate::service::ServiceLoader;
use crate::transaction::Transaction;

/// Only the first 4096 bytes of a new socket are considered for the handshake.
const HANDSHAKE_BUFFER_SIZE: usize = 4096;
/// A socket that connects but never sends its request is dropped after this.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The one cancellation signal shared by the listener and the manager tasks.
/// Setting it stops the accept loop, ends both sweeps after their current pass
/// and triggers the directory-wide worker shutdown.
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: tokio::sync::Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The listener and lifecycle of the whole server.
///
/// `run` binds, accepts and hands every admitted connection to the manager, then
/// tears everything down once the shutdown signal is set: workers are joined
/// through the directory and the remaining sockets closed. On restart all
/// sessions are gone; nothing is persisted.
pub struct WebSocketServer {
    config: ServerConfig,
    directory: Arc<ServiceDirectory>,
    manager: Manager,
    shutdown: Arc<ShutdownSignal>,
    bound_addr: OnceLock<SocketAddr>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, loader: Box<dyn ServiceLoader>) -> Self {
        let shutdown = Arc::new(ShutdownSignal::new());
        let directory = Arc::new(ServiceDirectory::new(loader));
        let manager = Manager::new(directory.clone(), shutdown.clone());
        Self {
            config,
            directory,
            manager,
            shutdown,
            bound_addr: OnceLock::new(),
        }
    }

    /// Handle used to request a graceful shutdown from outside the accept loop,
    /// e.g. from a Ctrl-C handler.
    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    /// The address actually bound, available once `run` has started listening.
    /// Useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    /// Binds and serves until the shutdown signal is set.
    pub async fn run(&self) -> Result<(), Error> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("attempting to start server on {addr}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let _ = self.bound_addr.set(local_addr);
        info!("server started, listening for connections on {local_addr}");

        let (io_task, switchboard_task) = self.manager.start();

        while !self.shutdown.is_set() {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.wait() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    info!("client connected from {addr}");
                    if let Err(err) = self.admit(stream, addr).await {
                        warn!("failed to admit client {addr}: {err}");
                    }
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }

        info!("shutting down server");
        let directory = self.directory.clone();
        if task::spawn_blocking(move || directory.join_all()).await.is_err() {
            warn!("worker shutdown task failed");
        }
        let _ = tokio::join!(io_task, switchboard_task);
        self.manager.close_all().await;
        Ok(())
    }

    /// Performs the handshake on a fresh socket and, on success, creates the
    /// connection, attaches it to the manager and announces it to its service.
    async fn admit(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<(), Error> {
        let request = Self::read_request(&mut stream).await?;
        let outcome = handshake::process_request(&request, &self.directory);
        stream.write_all(outcome.response.as_bytes()).await?;
        if outcome.close {
            info!("invalid request from {addr}");
            return Ok(());
        }
        let Some(record) = outcome.service else {
            return Ok(());
        };

        let connection = Connection::new(stream, addr, record.service_id());
        let connection_id = connection.id();
        let announced = record.try_send_inbound(Transaction::NewSocket {
            connection_id,
            addr,
        });
        if announced.is_err() {
            warn!(
                "service {} cannot take new clients right now, dropping {addr}",
                record.path()
            );
            return Ok(());
        }
        self.manager.add_connection(connection).await;
        Ok(())
    }

    /// Reads the initial request, stopping at the end of the header block, a
    /// closed socket or the buffer cap.
    async fn read_request(stream: &mut TcpStream) -> Result<String, Error> {
        let mut header_buf = BytesMut::with_capacity(HANDSHAKE_BUFFER_SIZE);
        let mut tmp = [0u8; 1024];
        while header_buf.len() < HANDSHAKE_BUFFER_SIZE {
            let n = timeout(HANDSHAKE_TIMEOUT, stream.read(&mut tmp)).await??;
            if n == 0 {
                break;
            }
            header_buf.extend_from_slice(&tmp[..n]);
            if header_buf.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&header_buf).into_owned())
    }
}
