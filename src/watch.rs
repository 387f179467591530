//! Observe-then-re-arm watch helpers.
//!
//! Store watches deliver once. Every handler in this crate reads state through
//! one of these helpers, so reading and re-arming are the same call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info};

use crate::dispatch::ReconnectHandler;
use crate::store::{CoordinationStore, WatchedEvent, Watcher};
use crate::{Error, Result};

/// Lists the children of a fixed path, re-arming the child watch on every
/// observation.
pub struct ChildrenWatch {
    path: String,
    watcher: Arc<dyn Watcher>,
}

impl ChildrenWatch {
    pub fn new(path: impl Into<String>, watcher: Arc<dyn Watcher>) -> Self {
        Self {
            path: path.into(),
            watcher,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn observe(&self, store: &dyn CoordinationStore) -> Result<Vec<String>> {
        store.get_children(&self.path, Some(Arc::clone(&self.watcher)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetObservation {
    pub exists: bool,
    pub data: Option<Vec<u8>>,
    pub children: Vec<String>,
    /// Number of observations taken so far, including this one.
    pub generation: u64,
}

/// Tracks existence, payload and children of a single node.
///
/// A missing node only arms an existence watch; once it appears the data and
/// child watches are armed too. Register it with the session's reconnect
/// hooks to have an observation that failed mid-outage taken again.
pub struct TargetWatch {
    store: Arc<dyn CoordinationStore>,
    path: String,
    watcher: Arc<dyn Watcher>,
    last: Mutex<TargetObservation>,
    stale: AtomicBool,
}

struct TargetWatcher(Weak<TargetWatch>);

impl Watcher for TargetWatcher {
    fn process(&self, event: WatchedEvent) {
        let Some(target) = self.0.upgrade() else {
            return;
        };
        info!("{:?} on {}", event.event_type, target.path);
        target.observe_or_defer();
    }
}

impl ReconnectHandler for TargetWatch {
    fn on_reconnect(&self) {
        if self.stale.swap(false, Ordering::AcqRel) {
            self.observe_or_defer();
        }
    }
}

impl TargetWatch {
    pub fn start(store: Arc<dyn CoordinationStore>, path: impl Into<String>) -> Result<Arc<Self>> {
        let path = path.into();
        let target = Arc::new_cyclic(|weak: &Weak<TargetWatch>| TargetWatch {
            store,
            path,
            watcher: Arc::new(TargetWatcher(weak.clone())),
            last: Mutex::new(TargetObservation::default()),
            stale: AtomicBool::new(false),
        });
        target.observe()?;
        Ok(target)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn last(&self) -> Result<TargetObservation> {
        self.last
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| Error::LockPoisoned("target observation"))
    }

    /// Whether a failed re-observation is waiting for a reconnect.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn observe_or_defer(&self) {
        match self.observe() {
            Ok(_) => self.stale.store(false, Ordering::Release),
            Err(err) => {
                self.stale.store(true, Ordering::Release);
                error!("failed to re-arm watch on {}: {err}", self.path);
            }
        }
    }

    fn observe(&self) -> Result<TargetObservation> {
        let watcher = Some(Arc::clone(&self.watcher));
        let mut observation = TargetObservation::default();
        if self.store.exists(&self.path, watcher.clone())?.is_some() {
            observation.data = self.store.get_data(&self.path, watcher.clone())?;
            observation.exists = observation.data.is_some();
            if observation.exists {
                match self.store.get_children(&self.path, watcher) {
                    Ok(children) => observation.children = children,
                    // Deleted after the payload read; the armed watches report it.
                    Err(Error::NoNode(_)) => observation.exists = false,
                    Err(err) => return Err(err),
                }
            }
        }

        let mut last = self
            .last
            .lock()
            .map_err(|_| Error::LockPoisoned("target observation"))?;
        observation.generation = last.generation + 1;
        *last = observation.clone();
        if observation.exists {
            info!(
                "{} data: {} children: {:?}",
                self.path,
                String::from_utf8_lossy(observation.data.as_deref().unwrap_or_default()),
                observation.children
            );
        }
        Ok(observation)
    }
}
