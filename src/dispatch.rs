//! Connection-state routing and the process lifetime signal.
//!
//! Node events are delivered straight to the watcher that armed them (the
//! election's predecessor watch, the registry's children watch). Everything
//! that reaches the session's default watcher is a connection-state change;
//! [`SessionWatcher`] logs it, runs the [`ReconnectHooks`] when the connection
//! comes back, and resolves the [`ShutdownSignal`] once the session is gone
//! for good. A plain disconnect is transient and resolves nothing.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use crate::store::{EventType, KeeperState, WatchedEvent, Watcher};

/// Why the session's lifetime ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Expired,
    Closed,
    /// The signal was dropped without the session reporting an end.
    Abandoned,
}

impl SessionEnd {
    /// `None` for states the session survives.
    pub fn from_state(state: KeeperState) -> Option<Self> {
        if !state.is_terminal() {
            return None;
        }
        Some(match state {
            KeeperState::Expired => SessionEnd::Expired,
            _ => SessionEnd::Closed,
        })
    }
}

/// Resolved exactly once, by the first terminal connection event.
pub struct ShutdownSignal {
    tx: Mutex<Option<mpsc::SyncSender<SessionEnd>>>,
}

pub struct ShutdownListener {
    rx: mpsc::Receiver<SessionEnd>,
}

pub fn shutdown_channel() -> (ShutdownSignal, ShutdownListener) {
    let (tx, rx) = mpsc::sync_channel(1);
    (
        ShutdownSignal {
            tx: Mutex::new(Some(tx)),
        },
        ShutdownListener { rx },
    )
}

impl ShutdownSignal {
    /// Returns `true` if this call resolved the signal.
    pub fn resolve(&self, end: SessionEnd) -> bool {
        let sender = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => {
                let _ = tx.try_send(end);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }
}

impl ShutdownListener {
    /// Blocks until the session ends.
    pub fn wait(self) -> SessionEnd {
        self.rx.recv().unwrap_or(SessionEnd::Abandoned)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<SessionEnd> {
        match self.rx.recv_timeout(timeout) {
            Ok(end) => Some(end),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(SessionEnd::Abandoned),
        }
    }
}

/// Work a component must redo once the connection to the store is back,
/// typically a watch handler that failed while the store was unreachable.
pub trait ReconnectHandler: Send + Sync {
    fn on_reconnect(&self);
}

/// Handlers run on every `SyncConnected` seen by the session's default
/// watcher. Held weakly; dropped components unregister themselves.
#[derive(Default)]
pub struct ReconnectHooks {
    handlers: Mutex<Vec<Weak<dyn ReconnectHandler>>>,
}

impl ReconnectHooks {
    pub fn register(&self, handler: Weak<dyn ReconnectHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn notify(&self) {
        let live: Vec<Arc<dyn ReconnectHandler>> = {
            let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers.retain(|handler| handler.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };
        for handler in live {
            handler.on_reconnect();
        }
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-side ends of a session's default watcher.
pub struct SessionHandles {
    pub listener: ShutdownListener,
    pub hooks: Arc<ReconnectHooks>,
}

/// Builds a default watcher wired to a fresh shutdown channel and hook set.
pub fn session_watcher(name: impl Into<String>) -> (Arc<SessionWatcher>, SessionHandles) {
    let (signal, listener) = shutdown_channel();
    let watcher = Arc::new(SessionWatcher::new(name, signal));
    let hooks = watcher.reconnect_hooks();
    (watcher, SessionHandles { listener, hooks })
}

/// Default watcher for a session.
pub struct SessionWatcher {
    name: String,
    shutdown: ShutdownSignal,
    hooks: Arc<ReconnectHooks>,
}

impl SessionWatcher {
    pub fn new(name: impl Into<String>, shutdown: ShutdownSignal) -> Self {
        Self {
            name: name.into(),
            shutdown,
            hooks: Arc::default(),
        }
    }

    pub fn reconnect_hooks(&self) -> Arc<ReconnectHooks> {
        Arc::clone(&self.hooks)
    }
}

impl Watcher for SessionWatcher {
    fn process(&self, event: WatchedEvent) {
        if event.event_type != EventType::None {
            debug!(
                "[{}] ignoring {:?} for {:?} on the default watcher",
                self.name, event.event_type, event.path
            );
            return;
        }
        if let Some(end) = SessionEnd::from_state(event.state) {
            warn!("[{}] session ended: {end:?}", self.name);
            self.shutdown.resolve(end);
            return;
        }
        match event.state {
            KeeperState::SyncConnected => {
                info!("[{}] connected to coordination store", self.name);
                self.hooks.notify();
            }
            // Transient; the store may reconnect within the session timeout.
            _ => warn!("[{}] disconnected from coordination store", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn terminal_event_resolves_listener_once() {
        let (signal, listener) = shutdown_channel();
        let watcher = SessionWatcher::new("test", signal);

        watcher.process(WatchedEvent::connection(KeeperState::SyncConnected));
        watcher.process(WatchedEvent::connection(KeeperState::Disconnected));
        assert_eq!(listener.wait_timeout(Duration::from_millis(20)), None);

        watcher.process(WatchedEvent::connection(KeeperState::Expired));
        watcher.process(WatchedEvent::connection(KeeperState::Closed));
        assert_eq!(listener.wait(), SessionEnd::Expired);
    }

    #[test]
    fn node_events_do_not_resolve() {
        let (signal, listener) = shutdown_channel();
        let watcher = SessionWatcher::new("test", signal);
        watcher.process(WatchedEvent::node(EventType::NodeDeleted, "/election/c_0000000001"));
        assert_eq!(listener.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn disconnect_is_transient() {
        let (signal, listener) = shutdown_channel();
        let watcher = SessionWatcher::new("test", signal);
        watcher.process(WatchedEvent::connection(KeeperState::Disconnected));
        assert_eq!(listener.wait_timeout(Duration::from_millis(20)), None);
        watcher.process(WatchedEvent::connection(KeeperState::SyncConnected));
        assert_eq!(listener.wait_timeout(Duration::from_millis(20)), None);
    }

    struct Counting(AtomicUsize);

    impl ReconnectHandler for Counting {
        fn on_reconnect(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sync_connected_runs_live_hooks_and_prunes_dropped_ones() {
        let (signal, _listener) = shutdown_channel();
        let watcher = SessionWatcher::new("test", signal);
        let hooks = watcher.reconnect_hooks();

        let kept = Arc::new(Counting(AtomicUsize::new(0)));
        let dropped = Arc::new(Counting(AtomicUsize::new(0)));
        let kept_handler: Arc<dyn ReconnectHandler> = kept.clone();
        let dropped_handler: Arc<dyn ReconnectHandler> = dropped;
        hooks.register(Arc::downgrade(&kept_handler));
        hooks.register(Arc::downgrade(&dropped_handler));
        drop(dropped_handler);

        watcher.process(WatchedEvent::connection(KeeperState::Disconnected));
        assert_eq!(kept.0.load(Ordering::SeqCst), 0);
        watcher.process(WatchedEvent::connection(KeeperState::SyncConnected));
        assert_eq!(kept.0.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn session_end_follows_terminal_states() {
        assert_eq!(SessionEnd::from_state(KeeperState::Expired), Some(SessionEnd::Expired));
        assert_eq!(SessionEnd::from_state(KeeperState::Closed), Some(SessionEnd::Closed));
        assert_eq!(SessionEnd::from_state(KeeperState::Disconnected), None);
        assert_eq!(SessionEnd::from_state(KeeperState::SyncConnected), None);
    }

    #[test]
    fn dropped_signal_abandons_listener() {
        let (signal, listener) = shutdown_channel();
        assert!(!signal.is_resolved());
        drop(signal);
        assert_eq!(listener.wait(), SessionEnd::Abandoned);
    }
}
