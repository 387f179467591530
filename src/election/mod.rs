//! Leader election over ephemeral sequential candidate nodes.
//!
//! Every participant creates one candidate under the election namespace. The
//! lowest sequence leads. Everyone else watches only the candidate directly
//! ahead of it, so a departure wakes exactly one process instead of the whole
//! cohort.
//!
//! ```text
//! Unelected --(local is minimum)------------> Leader
//! Unelected --(predecessor watched)---------> Watching(p)
//! Watching(p) --(p deleted)-----------------> Unelected -> re-decide
//! ```
//!
//! `Leader` is terminal for the term; it ends with the session.
//!
//! A watch handler that fails for a reason other than the end of the term
//! (typically an unreachable store) leaves a pending retry behind. The
//! decision is re-run when the session reports `SyncConnected` again.

mod decision;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error, info, warn};

use crate::context::CoordinationContext;
use crate::dispatch::ReconnectHandler;
use crate::store::{child_name, join_path, CreateMode, EventType, WatchedEvent, Watcher};
use crate::{Error, Result};

pub use decision::{decide, Decision};

/// Receives election outcomes.
///
/// Invoked at most once per decision, never concurrently with another
/// decision of the same election. Implementations must not call back into
/// [`LeaderElection::elect_or_reelect`].
pub trait ElectionCallback: Send + Sync {
    fn on_elected_to_be_leader(&self);

    fn on_worker(&self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionState {
    Unelected,
    Leader,
    /// Watching the named predecessor candidate for deletion.
    Watching { predecessor: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionOutcome {
    Leader,
    Worker { leader: String, predecessor: String },
}

struct ElectionCore {
    candidate: Option<String>,
    state: ElectionState,
}

struct ElectionInner {
    ctx: CoordinationContext,
    namespace: String,
    callback: Arc<dyn ElectionCallback>,
    /// Serializes decisions, including those triggered from watch callbacks.
    decision: Mutex<()>,
    core: Mutex<ElectionCore>,
    decisions: AtomicU64,
    /// Set when a watch handler failed and nothing is armed to retry it.
    retry: AtomicBool,
    weak: Weak<ElectionInner>,
}

pub struct LeaderElection {
    inner: Arc<ElectionInner>,
}

struct PredecessorWatch {
    election: Weak<ElectionInner>,
    path: String,
}

impl Watcher for PredecessorWatch {
    fn process(&self, event: WatchedEvent) {
        let Some(election) = self.election.upgrade() else {
            return;
        };
        let outcome = match event.event_type {
            EventType::NodeDeleted => election.reelect_after_deletion(&self.path),
            // Connection events are the session watcher's business.
            EventType::None => Ok(()),
            // No decision to make, but the fired watch must be replaced.
            other => {
                debug!("ignoring {other:?} on {}", self.path);
                election.rearm_predecessor(&self.path)
            }
        };
        if let Err(err) = outcome {
            error!("handling {:?} on {} failed: {err}", event.event_type, self.path);
        }
    }
}

impl LeaderElection {
    pub fn new(ctx: CoordinationContext, callback: Arc<dyn ElectionCallback>) -> Self {
        let namespace = ctx.config().election_namespace.clone();
        let inner = Arc::new_cyclic(|weak| ElectionInner {
            ctx,
            namespace,
            callback,
            decision: Mutex::new(()),
            core: Mutex::new(ElectionCore {
                candidate: None,
                state: ElectionState::Unelected,
            }),
            decisions: AtomicU64::new(0),
            retry: AtomicBool::new(false),
            weak: weak.clone(),
        });
        let handler: Weak<dyn ReconnectHandler> = Arc::downgrade(&inner) as Weak<_>;
        inner.ctx.reconnect_hooks().register(handler);
        Self { inner }
    }

    /// Creates this process's candidate node and returns its name relative to
    /// the election namespace. Once per session.
    pub fn volunteer(&self) -> Result<String> {
        let inner = &self.inner;
        let mut core = inner.core()?;
        if core.candidate.is_some() {
            return Err(Error::AlreadyVolunteered);
        }
        inner.ctx.ensure_namespace(&inner.namespace)?;
        let prefix = inner.ctx.config().candidate_path_prefix();
        let full_path = inner
            .ctx
            .store()
            .create(&prefix, b"", CreateMode::EphemeralSequential)?;
        let name = child_name(&inner.namespace, &full_path)
            .ok_or_else(|| {
                Error::StoreProtocol(format!(
                    "candidate {full_path} created outside {}",
                    inner.namespace
                ))
            })?
            .to_string();
        info!("candidate node {full_path}");
        core.candidate = Some(name.clone());
        Ok(name)
    }

    /// Runs the election decision until it settles on leader or on a watched
    /// predecessor. Calling it while already leader re-checks the candidate
    /// against the store without invoking the callback again.
    pub fn elect_or_reelect(&self) -> Result<ElectionOutcome> {
        let _decision = self.inner.decision_lock()?;
        self.inner.retry.store(false, Ordering::Release);
        self.inner.run_decision()
    }

    /// Deletes the candidate node and returns to `Unelected`. Safe to call
    /// repeatedly and after the session has ended.
    pub fn resign(&self) -> Result<()> {
        let _decision = self.inner.decision_lock()?;
        let candidate = {
            let mut core = self.inner.core()?;
            core.state = ElectionState::Unelected;
            core.candidate.take()
        };
        let Some(name) = candidate else {
            return Ok(());
        };
        let path = join_path(&self.inner.namespace, &name);
        match self.inner.ctx.store().delete(&path) {
            Ok(()) | Err(Error::SessionExpired) => {
                info!("resigned candidate {path}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn state(&self) -> Result<ElectionState> {
        Ok(self.inner.core()?.state.clone())
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state(), Ok(ElectionState::Leader))
    }

    pub fn candidate_name(&self) -> Result<Option<String>> {
        Ok(self.inner.core()?.candidate.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Whether a failed re-election is waiting for the session to reconnect.
    pub fn retry_pending(&self) -> bool {
        self.inner.retry.load(Ordering::Acquire)
    }

    /// Number of settled decisions (leader or watching) so far.
    pub fn decisions(&self) -> u64 {
        self.inner.decisions.load(Ordering::Acquire)
    }
}

impl ElectionInner {
    fn core(&self) -> Result<MutexGuard<'_, ElectionCore>> {
        self.core
            .lock()
            .map_err(|_| Error::LockPoisoned("election state"))
    }

    fn decision_lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.decision
            .lock()
            .map_err(|_| Error::LockPoisoned("election decision"))
    }

    fn set_state(&self, state: ElectionState) -> Result<()> {
        self.core()?.state = state;
        Ok(())
    }

    /// Whether `path` is the predecessor the current state is watching.
    fn is_watching(&self, core: &ElectionCore, path: &str) -> bool {
        match &core.state {
            ElectionState::Watching { predecessor } => {
                child_name(&self.namespace, path) == Some(predecessor.as_str())
            }
            _ => false,
        }
    }

    fn rearm_predecessor(&self, path: &str) -> Result<()> {
        let _decision = self.decision_lock()?;
        let predecessor = {
            let core = self.core()?;
            if !self.is_watching(&core, path) {
                debug!("stale predecessor watch on {path}, state {:?}", core.state);
                return Ok(());
            }
            child_name(&self.namespace, path).unwrap_or_default().to_string()
        };
        match self.watch_predecessor(&predecessor) {
            Ok(()) => Ok(()),
            // Gone while we were re-arming: same as a delivered deletion.
            Err(Error::RaceLost { .. }) => self.reelect_locked(path),
            Err(err) => self.defer(err),
        }
    }

    fn reelect_after_deletion(&self, path: &str) -> Result<()> {
        let _decision = self.decision_lock()?;
        {
            let core = self.core()?;
            if !self.is_watching(&core, path) {
                debug!("stale predecessor watch on {path}, state {:?}", core.state);
                return Ok(());
            }
        }
        self.reelect_locked(path)
    }

    /// Caller holds the decision lock and has checked `path` is the watched
    /// predecessor.
    fn reelect_locked(&self, path: &str) -> Result<()> {
        self.set_state(ElectionState::Unelected)?;
        info!("predecessor {path} deleted, re-electing");
        match self.run_decision() {
            Ok(_) => Ok(()),
            Err(err) => self.defer(err),
        }
    }

    /// Handler-side failure: the term is over, or the decision is left
    /// pending until the next reconnect.
    fn defer(&self, err: Error) -> Result<()> {
        if err.is_term_fatal() {
            warn!("election term ended: {err}");
            return Ok(());
        }
        self.retry.store(true, Ordering::Release);
        Err(err)
    }

    fn retry_after_reconnect(&self) -> Result<()> {
        if !self.retry.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _decision = self.decision_lock()?;
        if self.core()?.candidate.is_none() {
            debug!("resigned while a retry was pending, nothing to do");
            return Ok(());
        }
        self.set_state(ElectionState::Unelected)?;
        info!("connection restored, re-running election");
        match self.run_decision() {
            Ok(_) => Ok(()),
            Err(err) => self.defer(err),
        }
    }

    /// Caller holds the decision lock. A term-fatal failure leaves the
    /// election `Unelected`.
    fn run_decision(&self) -> Result<ElectionOutcome> {
        let outcome = self.decision_loop();
        if let Err(err) = &outcome {
            if err.is_term_fatal() {
                self.set_state(ElectionState::Unelected)?;
            }
        }
        outcome
    }

    fn decision_loop(&self) -> Result<ElectionOutcome> {
        let local = self.core()?.candidate.clone().ok_or(Error::NotVolunteered)?;
        let store = self.ctx.store();
        loop {
            let children = store.get_children(&self.namespace, None)?;
            match decide(children, &local) {
                Decision::Lead => {
                    let was_leader = {
                        let mut core = self.core()?;
                        let was_leader = core.state == ElectionState::Leader;
                        core.state = ElectionState::Leader;
                        was_leader
                    };
                    // Re-confirming an existing term is not a new election.
                    if !was_leader {
                        self.decisions.fetch_add(1, Ordering::AcqRel);
                        info!("{local} is the leader");
                        self.callback.on_elected_to_be_leader();
                    }
                    return Ok(ElectionOutcome::Leader);
                }
                Decision::Absent => return Err(Error::CandidateMissing(local)),
                Decision::Follow {
                    leader,
                    predecessor,
                } => match self.watch_predecessor(&predecessor) {
                    Ok(()) => {
                        self.set_state(ElectionState::Watching {
                            predecessor: predecessor.clone(),
                        })?;
                        self.decisions.fetch_add(1, Ordering::AcqRel);
                        info!("{local} is not the leader ({leader} is), watching {predecessor}");
                        self.callback.on_worker();
                        return Ok(ElectionOutcome::Worker {
                            leader,
                            predecessor,
                        });
                    }
                    Err(Error::RaceLost { path }) => {
                        debug!("predecessor {path} vanished before watch, re-listing");
                    }
                    Err(err) => return Err(err),
                },
            }
        }
    }

    fn watch_predecessor(&self, predecessor: &str) -> Result<()> {
        let path = join_path(&self.namespace, predecessor);
        let watch: Arc<dyn Watcher> = Arc::new(PredecessorWatch {
            election: self.weak.clone(),
            path: path.clone(),
        });
        match self.ctx.store().exists(&path, Some(watch))? {
            Some(_) => Ok(()),
            None => Err(Error::RaceLost { path }),
        }
    }
}

impl ReconnectHandler for ElectionInner {
    fn on_reconnect(&self) {
        if let Err(err) = self.retry_after_reconnect() {
            error!("election retry after reconnect failed: {err}");
        }
    }
}
