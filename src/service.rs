use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::transaction::Transaction;

/// Capacity of a service's inbound and outbound queues.
pub const SERVICE_QUEUE_CAPACITY: usize = 1024;

/// How long a worker sleeps between inbound polls.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything a worker needs to talk to the switchboard.
pub struct ServiceContext {
    /// Cooperative stop signal; the worker's main loop must exit once set.
    pub shutdown: Arc<AtomicBool>,
    /// Transactions from the switchboard: `NewSocket`, `Data`, `Close`.
    pub inbound: Receiver<Transaction>,
    /// Transactions toward clients. Puts are non-blocking: `try_send` on a full
    /// queue fails and the transaction is the worker's to drop or retry.
    pub outbound: Sender<Transaction>,
}

/// The contract every service worker implements.
///
/// `run` is called once on a dedicated thread and should loop until the shutdown
/// flag is set, draining `inbound` promptly. A worker that returns or panics is
/// not restarted in place; its directory record is evicted on the next lookup and
/// the next request for the same path spawns a fresh one.
pub trait Service: Send + 'static {
    fn run(self: Box<Self>, ctx: ServiceContext);
}

/// Handle to a running worker: liveness probe, cooperative stop, join.
pub struct ServiceHandle {
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ServiceHandle {
    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Waits for the worker thread to terminate. Safe to call more than once.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("service worker panicked before joining");
            }
        }
    }
}

/// What a loader hands back for a freshly started worker: the handle plus the
/// switchboard-side queue endpoints.
pub struct SpawnedService {
    pub handle: ServiceHandle,
    pub inbound: Sender<Transaction>,
    pub outbound: Receiver<Transaction>,
}

/// Wires up queues, starts the worker on its own named thread and returns the
/// switchboard-side endpoints.
pub fn spawn_service(name: &str, service: Box<dyn Service>) -> std::io::Result<SpawnedService> {
    let (inbound_tx, inbound_rx) = mpsc::channel(SERVICE_QUEUE_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(SERVICE_QUEUE_CAPACITY);
    let shutdown = Arc::new(AtomicBool::new(false));
    let ctx = ServiceContext {
        shutdown: shutdown.clone(),
        inbound: inbound_rx,
        outbound: outbound_tx,
    };
    let thread = thread::Builder::new()
        .name(format!("service-{name}"))
        .spawn(move || service.run(ctx))?;
    Ok(SpawnedService {
        handle: ServiceHandle {
            shutdown,
            thread: Mutex::new(Some(thread)),
        },
        inbound: inbound_tx,
        outbound: outbound_rx,
    })
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("no service registered at `{0}`")]
    NotFound(String),

    #[error("failed to start service worker: {source}")]
    Spawn {
        #[from]
        source: std::io::Error,
    },
}

/// Turns a directory path into a running worker. Lookup failures surface to the
/// client as a 404 on the handshake.
pub trait ServiceLoader: Send + Sync {
    fn load(&self, location: &[String]) -> Result<SpawnedService, LoadError>;
}

type ServiceFactory = Box<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Loader backed by a fixed registry of path-to-factory bindings.
///
/// Rust has no counterpart to loading service code from the document root at
/// request time, so services are registered up front and spawned lazily on first
/// lookup. The document root is still carried for loaders that resolve services
/// from disk.
pub struct StaticServiceLoader {
    document_root: PathBuf,
    factories: HashMap<String, ServiceFactory>,
}

impl StaticServiceLoader {
    pub fn new(document_root: impl Into<PathBuf>) -> Self {
        Self {
            document_root: document_root.into(),
            factories: HashMap::new(),
        }
    }

    /// Binds a slash-joined service path (e.g. `demo_chatroom/index.ws`) to a
    /// factory invoked on every (re)spawn.
    pub fn register<S, F>(mut self, path: &str, factory: F) -> Self
    where
        S: Service,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.factories
            .insert(path.to_owned(), Box::new(move || Box::new(factory())));
        self
    }

    pub fn document_root(&self) -> &PathBuf {
        &self.document_root
    }
}

impl ServiceLoader for StaticServiceLoader {
    fn load(&self, location: &[String]) -> Result<SpawnedService, LoadError> {
        let path = location.join("/");
        let factory = self
            .factories
            .get(&path)
            .ok_or_else(|| LoadError::NotFound(path.clone()))?;
        Ok(spawn_service(&path, factory())?)
    }
}

/// Built-in demo service: echoes every text payload back to its sender.
pub struct EchoService;

impl Service for EchoService {
    fn run(self: Box<Self>, mut ctx: ServiceContext) {
        info!("echo service started");
        while !ctx.shutdown.load(Ordering::Relaxed) {
            while let Ok(transaction) = ctx.inbound.try_recv() {
                match transaction {
                    Transaction::NewSocket {
                        connection_id,
                        addr,
                    } => info!("echo: client {connection_id} connected from {addr}"),
                    Transaction::Data {
                        connection_id,
                        payload,
                    } => {
                        let reply = Transaction::Data {
                            connection_id,
                            payload,
                        };
                        if let Err(err) = ctx.outbound.try_send(reply) {
                            warn!("echo: dropping reply for client {connection_id}: {err}");
                        }
                    }
                    Transaction::Close { connection_id } => {
                        debug!("echo: client {connection_id} disconnected")
                    }
                }
            }
            thread::sleep(WORKER_POLL_INTERVAL);
        }
        info!("echo service shutting down");
    }
}
