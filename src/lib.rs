//! Leader election and service registry recipes for hierarchical,
//! watch-capable coordination stores.
//!
//! The store is consumed through [`CoordinationStore`]; [`memory`] provides an
//! in-process implementation for tests and demos.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod election;
pub mod error;
pub mod memory;
pub mod node;
pub mod registry;
pub mod role;
pub mod store;
pub mod watch;

pub use config::HeraldConfig;
pub use context::CoordinationContext;
pub use dispatch::{
    session_watcher, ReconnectHandler, ReconnectHooks, SessionEnd, SessionHandles, SessionWatcher,
    ShutdownListener, ShutdownSignal,
};
pub use election::{ElectionCallback, ElectionOutcome, ElectionState, LeaderElection};
pub use error::{Error, Result};
pub use memory::{MemoryEnsemble, MemorySession, OpStats};
pub use node::ClusterNode;
pub use registry::{AddressSnapshot, ServiceRegistry};
pub use role::ClusterRoleAction;
pub use store::{
    CoordinationStore, CreateMode, EventType, KeeperState, NodeStat, WatchedEvent, Watcher,
};
pub use watch::{ChildrenWatch, TargetObservation, TargetWatch};
