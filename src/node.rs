use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::config::HeraldConfig;
use crate::context::CoordinationContext;
use crate::dispatch::{SessionEnd, SessionHandles, ShutdownListener};
use crate::election::{ElectionOutcome, LeaderElection};
use crate::registry::ServiceRegistry;
use crate::role::ClusterRoleAction;
use crate::store::CoordinationStore;
use crate::Result;

/// One cluster participant: election, registry and the role action that
/// ties them together, bound to a single session.
pub struct ClusterNode {
    name: String,
    election: LeaderElection,
    registry: Arc<ServiceRegistry>,
    listener: ShutdownListener,
}

impl ClusterNode {
    /// Volunteers and runs the first election. `handles` must come from the
    /// default watcher `store` was connected with, so that reconnects and the
    /// end of the session reach this node.
    pub fn start(
        name: impl Into<String>,
        config: HeraldConfig,
        address: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        handles: SessionHandles,
    ) -> Result<Self> {
        let name = name.into();
        let SessionHandles { listener, hooks } = handles;
        let ctx = CoordinationContext::new(store, config)?.with_reconnect_hooks(hooks);
        let registry = Arc::new(ServiceRegistry::new(ctx.clone())?);
        let action = Arc::new(ClusterRoleAction::new(Arc::clone(&registry), address));
        let election = LeaderElection::new(ctx, action);

        let candidate = election.volunteer()?;
        let outcome = election.elect_or_reelect()?;
        match &outcome {
            ElectionOutcome::Leader => info!("[{name}] started as leader ({candidate})"),
            ElectionOutcome::Worker { leader, .. } => {
                info!("[{name}] started as worker ({candidate}), leader is {leader}")
            }
        }
        Ok(Self {
            name,
            election,
            registry,
            listener,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn election(&self) -> &LeaderElection {
        &self.election
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn wait_for_shutdown(&self, timeout: Duration) -> Option<SessionEnd> {
        self.listener.wait_timeout(timeout)
    }

    /// Blocks until the session ends; all progress meanwhile happens on the
    /// store's event thread.
    pub fn run_until_shutdown(self) -> SessionEnd {
        let end = self.listener.wait();
        info!("[{}] session ended: {end:?}", self.name);
        end
    }
}
