//! In-process coordination store.
//!
//! `MemoryEnsemble` holds a single hierarchical tree shared by any number of
//! sessions. Each [`MemorySession`] implements [`CoordinationStore`] and owns
//! an event thread that delivers its watch notifications in order, the same
//! way a networked client hands events to a dedicated callback thread.
//!
//! An outage toggled with [`MemoryEnsemble::set_available`] that outlasts the
//! configured session timeout expires every session when the ensemble comes
//! back, as a real ensemble would on reconnect.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::HeraldConfig;
use crate::store::{
    child_name, is_valid_path, parent_path, CoordinationStore, CreateMode, EventType,
    KeeperState, NodeStat, WatchedEvent, Watcher,
};
use crate::{Error, Result};

struct Delivery {
    watcher: Arc<dyn Watcher>,
    event: WatchedEvent,
}

struct WatchEntry {
    session: u64,
    watcher: Arc<dyn Watcher>,
}

struct SessionEntry {
    events: mpsc::Sender<Delivery>,
    default_watcher: Arc<dyn Watcher>,
}

struct Node {
    data: Vec<u8>,
    czxid: u64,
    version: u32,
    ephemeral_owner: Option<u64>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, czxid: u64, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            czxid,
            version: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat {
            czxid: self.czxid,
            version: self.version,
            ephemeral_owner: self.ephemeral_owner,
            num_children: self.children.len(),
            data_length: self.data.len(),
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    zxid: u64,
    sessions: HashMap<u64, SessionEntry>,
    data_watches: HashMap<String, Vec<WatchEntry>>,
    child_watches: HashMap<String, Vec<WatchEntry>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), 0, None));
        Self {
            nodes,
            zxid: 0,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }

    fn deliver(&self, session: u64, watcher: Arc<dyn Watcher>, event: WatchedEvent) {
        if let Some(entry) = self.sessions.get(&session) {
            // A closed receiver means the session's event thread is gone.
            let _ = entry.events.send(Delivery { watcher, event });
        }
    }

    fn deliver_connection(&self, state: KeeperState) {
        for entry in self.sessions.values() {
            let _ = entry.events.send(Delivery {
                watcher: Arc::clone(&entry.default_watcher),
                event: WatchedEvent::connection(state),
            });
        }
    }

    fn arm(
        watches: &mut HashMap<String, Vec<WatchEntry>>,
        path: &str,
        session: u64,
        watcher: Arc<dyn Watcher>,
    ) {
        let entries = watches.entry(path.to_string()).or_default();
        let duplicate = entries.iter().any(|entry| {
            entry.session == session
                && std::ptr::addr_eq(Arc::as_ptr(&entry.watcher), Arc::as_ptr(&watcher))
        });
        if !duplicate {
            entries.push(WatchEntry { session, watcher });
        }
    }

    fn fire(&mut self, child_watch: bool, path: &str, event_type: EventType) {
        let table = if child_watch {
            &mut self.child_watches
        } else {
            &mut self.data_watches
        };
        let Some(entries) = table.remove(path) else {
            return;
        };
        for entry in entries {
            self.deliver(
                entry.session,
                entry.watcher,
                WatchedEvent::node(event_type, path),
            );
        }
    }

    fn remove_node(&mut self, path: &str) -> bool {
        if self.nodes.remove(path).is_none() {
            return false;
        }
        if let Some(parent) = parent_path(path) {
            let name = child_name(parent, path);
            if let (Some(node), Some(name)) = (self.nodes.get_mut(parent), name) {
                node.children.remove(name);
            }
            self.zxid += 1;
            self.fire(false, path, EventType::NodeDeleted);
            self.fire(true, path, EventType::NodeDeleted);
            self.fire(true, parent, EventType::NodeChildrenChanged);
        }
        true
    }

    fn drop_watches(&mut self, session: u64) {
        for table in [&mut self.data_watches, &mut self.child_watches] {
            table.retain(|_, entries| {
                entries.retain(|entry| entry.session != session);
                !entries.is_empty()
            });
        }
    }

    fn ephemerals_of(&self, session: u64) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

struct EnsembleInner {
    /// Connect string the ensemble answers to; only used for logging.
    name: String,
    tree: Mutex<Tree>,
    available: AtomicBool,
    outage_since: Mutex<Option<Instant>>,
    session_timeout: Duration,
    next_session: AtomicU64,
    sequence_width: usize,
}

impl EnsembleInner {
    fn lock(&self) -> Result<MutexGuard<'_, Tree>> {
        self.tree
            .lock()
            .map_err(|_| Error::LockPoisoned("memory ensemble tree"))
    }

    fn end_session(&self, session: u64, state: KeeperState) -> Result<bool> {
        let mut tree = self.lock()?;
        if !tree.sessions.contains_key(&session) {
            return Ok(false);
        }
        tree.drop_watches(session);
        let ephemerals = tree.ephemerals_of(session);
        for path in &ephemerals {
            tree.remove_node(path);
        }
        if let Some(entry) = tree.sessions.remove(&session) {
            let _ = entry.events.send(Delivery {
                watcher: entry.default_watcher,
                event: WatchedEvent::connection(state),
            });
        }
        info!(
            "session {session:#x} ended ({state:?}), removed {} ephemeral node(s)",
            ephemerals.len()
        );
        Ok(true)
    }
}

/// Shared in-memory tree that sessions connect to.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::from_config(&HeraldConfig::default())
    }

    /// Takes the connect string, session timeout and sequence width from
    /// `config`.
    pub fn from_config(config: &HeraldConfig) -> Self {
        Self {
            inner: Arc::new(EnsembleInner {
                name: config.connect.clone(),
                tree: Mutex::new(Tree::new()),
                available: AtomicBool::new(true),
                outage_since: Mutex::new(None),
                session_timeout: config.session_timeout(),
                next_session: AtomicU64::new(1),
                sequence_width: config.sequence_width,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Opens a session. `default_watcher` receives connection-state events,
    /// starting with `SyncConnected`.
    pub fn connect(&self, default_watcher: Arc<dyn Watcher>) -> Result<Arc<MemorySession>> {
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(Error::CoordinationUnavailable(
                "ensemble is not accepting connections".to_string(),
            ));
        }
        let id = self.inner.next_session.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::channel();
        let handle = spawn_event_thread(id, rx)?;
        let thread_id = handle.thread().id();
        {
            let mut tree = self.inner.lock()?;
            tree.sessions.insert(
                id,
                SessionEntry {
                    events: tx,
                    default_watcher: Arc::clone(&default_watcher),
                },
            );
            tree.deliver(
                id,
                default_watcher,
                WatchedEvent::connection(KeeperState::SyncConnected),
            );
        }
        debug!("session {id:#x} connected to {}", self.inner.name);
        Ok(Arc::new(MemorySession {
            id,
            ensemble: Arc::clone(&self.inner),
            counters: OpCounters::default(),
            event_thread: Mutex::new(Some(handle)),
            event_thread_id: thread_id,
        }))
    }

    /// Expires a session as the store would after a missed session timeout.
    /// Returns `false` if the session had already ended.
    pub fn expire_session(&self, session: u64) -> Result<bool> {
        self.inner.end_session(session, KeeperState::Expired)
    }

    /// Simulates losing (or regaining) connectivity to the store. While
    /// unavailable every operation fails with `CoordinationUnavailable`.
    /// Sessions see `Disconnected`, then `SyncConnected` on recovery, or
    /// `Expired` if the outage lasted at least the session timeout.
    pub fn set_available(&self, available: bool) -> Result<()> {
        let mut outage_since = self
            .inner
            .outage_since
            .lock()
            .map_err(|_| Error::LockPoisoned("memory ensemble outage"))?;
        let previous = self.inner.available.swap(available, Ordering::AcqRel);
        if previous == available {
            return Ok(());
        }
        if !available {
            *outage_since = Some(Instant::now());
            warn!("ensemble {} unavailable", self.inner.name);
            self.inner.lock()?.deliver_connection(KeeperState::Disconnected);
            return Ok(());
        }

        let outage = outage_since
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        if outage < self.inner.session_timeout {
            info!("ensemble {} back after {outage:?}", self.inner.name);
            self.inner.lock()?.deliver_connection(KeeperState::SyncConnected);
            return Ok(());
        }
        let sessions: Vec<u64> = self.inner.lock()?.sessions.keys().copied().collect();
        warn!(
            "ensemble {} back after {outage:?}, past the session timeout; expiring {} session(s)",
            self.inner.name,
            sessions.len()
        );
        for session in sessions {
            self.inner.end_session(session, KeeperState::Expired)?;
        }
        Ok(())
    }

    pub fn session_count(&self) -> Result<usize> {
        Ok(self.inner.lock()?.sessions.len())
    }
}

fn spawn_event_thread(id: u64, rx: mpsc::Receiver<Delivery>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("herald-event-{id:x}"))
        .spawn(move || {
            while let Ok(Delivery { watcher, event }) = rx.recv() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| watcher.process(event)));
                if outcome.is_err() {
                    error!("watcher panicked on session {id:#x}; event thread keeps running");
                }
            }
            debug!("event thread for session {id:#x} stopped");
        })?;
    Ok(handle)
}

#[derive(Default)]
struct OpCounters {
    create: AtomicU64,
    exists: AtomicU64,
    get_children: AtomicU64,
    get_data: AtomicU64,
    set_data: AtomicU64,
    delete: AtomicU64,
}

/// Per-session operation counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpStats {
    pub create: u64,
    pub exists: u64,
    pub get_children: u64,
    pub get_data: u64,
    pub set_data: u64,
    pub delete: u64,
}

pub struct MemorySession {
    id: u64,
    ensemble: Arc<EnsembleInner>,
    counters: OpCounters,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    event_thread_id: ThreadId,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> OpStats {
        OpStats {
            create: self.counters.create.load(Ordering::Relaxed),
            exists: self.counters.exists.load(Ordering::Relaxed),
            get_children: self.counters.get_children.load(Ordering::Relaxed),
            get_data: self.counters.get_data.load(Ordering::Relaxed),
            set_data: self.counters.set_data.load(Ordering::Relaxed),
            delete: self.counters.delete.load(Ordering::Relaxed),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.ensemble
            .lock()
            .map(|tree| tree.sessions.contains_key(&self.id))
            .unwrap_or(false)
    }

    /// Ends the session: ephemeral nodes are removed and the default watcher
    /// receives `Closed`. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.ensemble.end_session(self.id, KeeperState::Closed)?;
        self.join_event_thread();
        Ok(())
    }

    fn join_event_thread(&self) {
        if thread::current().id() == self.event_thread_id {
            return;
        }
        let handle = match self.event_thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn tree(&self) -> Result<MutexGuard<'_, Tree>> {
        if !self.ensemble.available.load(Ordering::Acquire) {
            return Err(Error::CoordinationUnavailable(
                "connection to ensemble lost".to_string(),
            ));
        }
        let tree = self.ensemble.lock()?;
        if !tree.sessions.contains_key(&self.id) {
            return Err(Error::SessionExpired);
        }
        Ok(tree)
    }
}

impl CoordinationStore for MemorySession {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.counters.create.fetch_add(1, Ordering::Relaxed);
        if !is_valid_path(path) {
            return Err(Error::StoreProtocol(format!("invalid path {path:?}")));
        }
        let parent = parent_path(path).ok_or_else(|| Error::NodeExists(path.to_string()))?;
        let width = self.ensemble.sequence_width;
        let mut tree = self.tree()?;

        let full_path = {
            let parent_node = tree
                .nodes
                .get_mut(parent)
                .ok_or_else(|| Error::NoNode(parent.to_string()))?;
            if parent_node.ephemeral_owner.is_some() {
                return Err(Error::StoreProtocol(format!(
                    "ephemeral node {parent} cannot have children"
                )));
            }
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            if mode.is_sequential() {
                sequential_name(path, sequence, width)
            } else {
                path.to_string()
            }
        };
        if tree.nodes.contains_key(&full_path) {
            return Err(Error::NodeExists(full_path));
        }
        let name = child_name(parent, &full_path)
            .ok_or_else(|| Error::StoreProtocol(format!("bad child path {full_path}")))?
            .to_string();

        tree.zxid += 1;
        let owner = mode.is_ephemeral().then_some(self.id);
        let node = Node::new(data.to_vec(), tree.zxid, owner);
        tree.nodes.insert(full_path.clone(), node);
        if let Some(parent_node) = tree.nodes.get_mut(parent) {
            parent_node.children.insert(name);
        }
        tree.fire(false, &full_path, EventType::NodeCreated);
        tree.fire(true, parent, EventType::NodeChildrenChanged);
        Ok(full_path)
    }

    fn exists(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>> {
        self.counters.exists.fetch_add(1, Ordering::Relaxed);
        let mut tree = self.tree()?;
        let stat = tree.nodes.get(path).map(Node::stat);
        if let Some(watcher) = watch {
            Tree::arm(&mut tree.data_watches, path, self.id, watcher);
        }
        Ok(stat)
    }

    fn get_children(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Vec<String>> {
        self.counters.get_children.fetch_add(1, Ordering::Relaxed);
        let mut tree = self.tree()?;
        let children = tree
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect::<Vec<_>>())
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(watcher) = watch {
            Tree::arm(&mut tree.child_watches, path, self.id, watcher);
        }
        Ok(children)
    }

    fn get_data(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Option<Vec<u8>>> {
        self.counters.get_data.fetch_add(1, Ordering::Relaxed);
        let mut tree = self.tree()?;
        let Some(data) = tree.nodes.get(path).map(|node| node.data.clone()) else {
            return Ok(None);
        };
        if let Some(watcher) = watch {
            Tree::arm(&mut tree.data_watches, path, self.id, watcher);
        }
        Ok(Some(data))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> Result<NodeStat> {
        self.counters.set_data.fetch_add(1, Ordering::Relaxed);
        let mut tree = self.tree()?;
        let stat = {
            let node = tree
                .nodes
                .get_mut(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?;
            node.data = data.to_vec();
            node.version += 1;
            node.stat()
        };
        tree.zxid += 1;
        tree.fire(false, path, EventType::NodeDataChanged);
        Ok(stat)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.counters.delete.fetch_add(1, Ordering::Relaxed);
        if path == "/" {
            return Err(Error::StoreProtocol("cannot delete the root node".to_string()));
        }
        let mut tree = self.tree()?;
        if let Some(node) = tree.nodes.get(path) {
            if !node.children.is_empty() {
                return Err(Error::StoreProtocol(format!("node {path} has children")));
            }
        }
        tree.remove_node(path);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let _ = self.ensemble.end_session(self.id, KeeperState::Closed);
        self.join_event_thread();
    }
}

/// Appends the zero-padded sequence to `prefix`, the way the ensemble names
/// sequential nodes.
pub fn sequential_name(prefix: &str, sequence: u64, width: usize) -> String {
    format!("{prefix}{sequence:0width$}")
}
