//! Primitive contract consumed from the coordination store.
//!
//! The store itself (consensus, persistence, session management) lives outside
//! this crate. Election and registry only talk to it through
//! [`CoordinationStore`], and receive asynchronous notifications through
//! [`Watcher`] callbacks delivered on the store's event thread.

use std::sync::Arc;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    /// Removed by the store when the owning session ends.
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Connection state change; `path` is `None`.
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperState {
    SyncConnected,
    Disconnected,
    Expired,
    /// The session was closed by its owner.
    Closed,
}

impl KeeperState {
    /// States after which no further events arrive for the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, KeeperState::Expired | KeeperState::Closed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn connection(state: KeeperState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: KeeperState::SyncConnected,
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStat {
    /// Store-wide creation order of the node.
    pub czxid: u64,
    pub version: u32,
    pub ephemeral_owner: Option<u64>,
    pub num_children: usize,
    pub data_length: usize,
}

/// One-shot notification target.
///
/// A watch armed through [`CoordinationStore`] fires at most once. Handlers
/// that want to keep observing must arm a new watch before returning.
pub trait Watcher: Send + Sync {
    fn process(&self, event: WatchedEvent);
}

impl<F> Watcher for F
where
    F: Fn(WatchedEvent) + Send + Sync,
{
    fn process(&self, event: WatchedEvent) {
        self(event)
    }
}

pub trait CoordinationStore: Send + Sync {
    /// Creates a node and returns its full path. Sequential modes append a
    /// fixed-width, monotonically increasing suffix to `path`.
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Returns `None` when the node does not exist. A watch is armed in both
    /// cases and fires on creation, deletion or data change.
    fn exists(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>>;

    /// Lists child names (relative to `path`). The watch fires when the child
    /// set changes or `path` itself is deleted.
    fn get_children(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Vec<String>>;

    /// Returns `None` when the node does not exist; no watch is armed then.
    fn get_data(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Option<Vec<u8>>>;

    fn set_data(&self, path: &str, data: &[u8]) -> Result<NodeStat>;

    /// Removes a node. Deleting an absent node is a no-op.
    fn delete(&self, path: &str) -> Result<()>;
}

impl<S: CoordinationStore + ?Sized> CoordinationStore for Arc<S> {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        (**self).create(path, data, mode)
    }

    fn exists(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>> {
        (**self).exists(path, watch)
    }

    fn get_children(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Vec<String>> {
        (**self).get_children(path, watch)
    }

    fn get_data(&self, path: &str, watch: Option<Arc<dyn Watcher>>) -> Result<Option<Vec<u8>>> {
        (**self).get_data(path, watch)
    }

    fn set_data(&self, path: &str, data: &[u8]) -> Result<NodeStat> {
        (**self).set_data(path, data)
    }

    fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path)
    }
}

pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Strips `parent/` from `full_path`, returning the child name.
pub fn child_name<'a>(parent: &str, full_path: &'a str) -> Option<&'a str> {
    let rest = if parent == "/" {
        full_path.strip_prefix('/')?
    } else {
        full_path.strip_prefix(parent)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|segment| !segment.is_empty())
}
