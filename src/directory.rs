use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::service::{ServiceHandle, ServiceLoader, SpawnedService};
use crate::transaction::Transaction;

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(0);

/// A registered, running service: worker handle plus the switchboard-side queue
/// endpoints, under the path it was spawned for.
pub struct ServiceRecord {
    service_id: u64,
    path: String,
    handle: ServiceHandle,
    inbound: Sender<Transaction>,
    outbound: Mutex<Receiver<Transaction>>,
}

impl ServiceRecord {
    fn new(path: String, spawned: SpawnedService) -> Self {
        Self {
            service_id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
            path,
            handle: spawned.handle,
            inbound: spawned.inbound,
            outbound: Mutex::new(spawned.outbound),
        }
    }

    /// Process-unique id of this worker incarnation; a respawn gets a fresh one.
    pub fn service_id(&self) -> u64 {
        self.service_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    /// Non-blocking put on the service's inbound queue.
    pub fn try_send_inbound(
        &self,
        transaction: Transaction,
    ) -> Result<(), TrySendError<Transaction>> {
        self.inbound.try_send(transaction)
    }

    /// Non-blocking take from the service's outbound queue.
    pub(crate) fn try_recv_outbound(&self) -> Option<Transaction> {
        self.outbound.lock().unwrap().try_recv().ok()
    }
}

#[derive(Default)]
struct DirNode {
    subdirs: HashMap<String, DirNode>,
    services: HashMap<String, Arc<ServiceRecord>>,
}

impl DirNode {
    fn collect(&self, out: &mut Vec<Arc<ServiceRecord>>) {
        for subdir in self.subdirs.values() {
            subdir.collect(out);
        }
        out.extend(self.services.values().cloned());
    }
}

/// Path-addressed registry of long-lived workers.
///
/// Services live in a tree keyed by path segments; only the terminal segment
/// names a service, every other segment names a subdirectory. Workers are spawned
/// lazily on first lookup and evicted on the first lookup after they stop running,
/// which is also what triggers a respawn on demand. One directory-wide lock
/// guards every structural change.
pub struct ServiceDirectory {
    root: Mutex<DirNode>,
    loader: Box<dyn ServiceLoader>,
}

impl ServiceDirectory {
    pub fn new(loader: Box<dyn ServiceLoader>) -> Self {
        Self {
            root: Mutex::new(DirNode::default()),
            loader,
        }
    }

    /// Resolves a location to a live service record, spawning one through the
    /// loader if needed. Returns `None` when the loader cannot produce a worker
    /// for the path, which the handshake reports as 404.
    pub fn lookup(&self, location: &[String]) -> Option<Arc<ServiceRecord>> {
        let (terminal, dirs) = location.split_last()?;
        let mut root = self.root.lock().unwrap();
        let mut node = &mut *root;
        for dir in dirs {
            // First-time paths populate the tree with empty subdirectories.
            node = node.subdirs.entry(dir.clone()).or_default();
        }
        match node.services.get(terminal) {
            Some(record) if record.is_alive() => return Some(record.clone()),
            Some(record) => {
                info!("service {} is no longer running, evicting", record.path());
                node.services.remove(terminal);
            }
            None => {}
        }
        match self.loader.load(location) {
            Ok(spawned) => {
                let record = Arc::new(ServiceRecord::new(location.join("/"), spawned));
                info!("service {} started", record.path());
                node.services.insert(terminal.clone(), record.clone());
                Some(record)
            }
            Err(err) => {
                debug!("no service at {}: {err}", location.join("/"));
                None
            }
        }
    }

    /// Registers an already-spawned record under a location. Succeeds only when
    /// the terminal segment is free and the worker is still running.
    pub fn add(&self, location: &[String], record: Arc<ServiceRecord>) -> bool {
        let Some((terminal, dirs)) = location.split_last() else {
            return false;
        };
        let mut root = self.root.lock().unwrap();
        let mut node = &mut *root;
        for dir in dirs {
            node = node.subdirs.entry(dir.clone()).or_default();
        }
        if node.services.contains_key(terminal) || !record.is_alive() {
            return false;
        }
        node.services.insert(terminal.clone(), record);
        true
    }

    /// Snapshot of every registered record, for the switchboard sweep.
    pub fn all_services(&self) -> Vec<Arc<ServiceRecord>> {
        let root = self.root.lock().unwrap();
        let mut out = Vec::new();
        root.collect(&mut out);
        out
    }

    /// Stops every worker, depth-first: sets each shutdown flag, then joins.
    pub fn join_all(&self) {
        let records = self.all_services();
        for record in records {
            record.handle().signal_shutdown();
            record.handle().join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{spawn_service, Service, ServiceContext, StaticServiceLoader};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    /// Worker that idles until its shutdown flag is set.
    struct IdleService;

    impl Service for IdleService {
        fn run(self: Box<Self>, ctx: ServiceContext) {
            while !ctx.shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn loc(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn idle_directory() -> (ServiceDirectory, Arc<AtomicUsize>) {
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let counter = spawn_count.clone();
        struct CountingLoader {
            counter: Arc<AtomicUsize>,
        }
        impl ServiceLoader for CountingLoader {
            fn load(
                &self,
                location: &[String],
            ) -> Result<SpawnedService, crate::service::LoadError> {
                self.counter.fetch_add(1, Ordering::Relaxed);
                Ok(spawn_service(&location.join("/"), Box::new(IdleService))?)
            }
        }
        (
            ServiceDirectory::new(Box::new(CountingLoader { counter })),
            spawn_count,
        )
    }

    #[test]
    fn lazy_spawn_and_respawn_after_death() {
        let (directory, spawn_count) = idle_directory();
        let location = loc(&["foo", "bar.ws"]);

        let first = directory.lookup(&location).expect("first lookup spawns");
        assert_eq!(spawn_count.load(Ordering::Relaxed), 1);

        let second = directory.lookup(&location).expect("second lookup hits");
        assert_eq!(second.service_id(), first.service_id());
        assert_eq!(spawn_count.load(Ordering::Relaxed), 1);

        first.handle().signal_shutdown();
        first.handle().join();

        let third = directory.lookup(&location).expect("third lookup respawns");
        assert_ne!(third.service_id(), first.service_id());
        assert_eq!(spawn_count.load(Ordering::Relaxed), 2);
        third.handle().signal_shutdown();
        third.handle().join();
    }

    #[test]
    fn failed_load_returns_none() {
        let loader = StaticServiceLoader::new(".");
        let directory = ServiceDirectory::new(Box::new(loader));
        assert!(directory.lookup(&loc(&["nope.ws"])).is_none());
    }

    #[test]
    fn add_rejects_duplicates_and_dead_workers() {
        let (directory, _) = idle_directory();
        let location = loc(&["svc.ws"]);
        let record = directory.lookup(&location).unwrap();

        let duplicate = Arc::new(ServiceRecord::new(
            "svc.ws".into(),
            spawn_service("dup", Box::new(IdleService)).unwrap(),
        ));
        assert!(!directory.add(&location, duplicate.clone()));
        duplicate.handle().signal_shutdown();
        duplicate.handle().join();

        // A dead record is refused even under a free name.
        assert!(!directory.add(&loc(&["other.ws"]), duplicate));

        record.handle().signal_shutdown();
        record.handle().join();
    }

    #[test]
    fn join_all_stops_every_worker() {
        let (directory, _) = idle_directory();
        let records = vec![
            directory.lookup(&loc(&["a.ws"])).unwrap(),
            directory.lookup(&loc(&["nested", "b.ws"])).unwrap(),
            directory.lookup(&loc(&["nested", "deep", "c.ws"])).unwrap(),
        ];
        assert!(records.iter().all(|r| r.is_alive()));

        directory.join_all();
        assert!(records.iter().all(|r| !r.is_alive()));
    }
}
