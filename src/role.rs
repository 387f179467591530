use std::sync::Arc;

use log::{error, info};

use crate::election::ElectionCallback;
use crate::registry::ServiceRegistry;

/// Maps election outcomes onto registry membership.
///
/// The leader coordinates and does not serve, so it leaves the registry and
/// watches it instead. Workers publish their address once.
pub struct ClusterRoleAction {
    registry: Arc<ServiceRegistry>,
    address: String,
}

impl ClusterRoleAction {
    pub fn new(registry: Arc<ServiceRegistry>, address: impl Into<String>) -> Self {
        Self {
            registry,
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl ElectionCallback for ClusterRoleAction {
    fn on_elected_to_be_leader(&self) {
        if let Err(err) = self.registry.unregister_self() {
            error!("leader failed to leave the registry: {err}");
            return;
        }
        match self.registry.watch_membership() {
            Ok(snapshot) => info!("leader tracking {} worker(s)", snapshot.len()),
            Err(err) => error!("leader failed to watch the registry: {err}"),
        }
    }

    fn on_worker(&self) {
        // Re-elections after a predecessor leaves land here again.
        if self.registry.is_registered() {
            return;
        }
        match self.registry.register_self(self.address.as_bytes()) {
            Ok(path) => info!("worker {} registered at {path}", self.address),
            Err(err) => error!("worker {} failed to register: {err}", self.address),
        }
    }
}
