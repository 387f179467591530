#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use herald::{
    session_watcher, CoordinationContext, ElectionCallback, LeaderElection, MemoryEnsemble,
    MemorySession, ShutdownListener, WatchedEvent, Watcher,
};

pub const SETTLE: Duration = Duration::from_secs(2);

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn quiet_watcher() -> Arc<dyn Watcher> {
    Arc::new(|_event: WatchedEvent| {})
}

#[derive(Default)]
pub struct RecordingCallback {
    pub leader: AtomicUsize,
    pub worker: AtomicUsize,
}

impl RecordingCallback {
    pub fn leader_calls(&self) -> usize {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn worker_calls(&self) -> usize {
        self.worker.load(Ordering::SeqCst)
    }
}

impl ElectionCallback for RecordingCallback {
    fn on_elected_to_be_leader(&self) {
        self.leader.fetch_add(1, Ordering::SeqCst);
    }

    fn on_worker(&self) {
        self.worker.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Candidate {
    pub session: Arc<MemorySession>,
    pub election: LeaderElection,
    pub callback: Arc<RecordingCallback>,
    pub shutdown: ShutdownListener,
}

/// Connects a new session and builds an election on it (not yet volunteered).
/// The context is wired to the session watcher's reconnect hooks.
pub fn candidate(ensemble: &MemoryEnsemble) -> Candidate {
    let (watcher, handles) = session_watcher("candidate");
    let session = ensemble.connect(watcher).expect("connect");
    let callback = Arc::new(RecordingCallback::default());
    let ctx =
        CoordinationContext::with_defaults(session.clone()).with_reconnect_hooks(handles.hooks);
    let election = LeaderElection::new(ctx, callback.clone());
    Candidate {
        session,
        election,
        callback,
        shutdown: handles.listener,
    }
}
