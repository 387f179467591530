use std::sync::Arc;

use log::debug;

use crate::config::HeraldConfig;
use crate::dispatch::ReconnectHooks;
use crate::store::{CoordinationStore, CreateMode};
use crate::{Error, Result};

/// Session-bound handle shared by every component of one process.
///
/// Components take a context at construction instead of reaching for an
/// ambient store handle. They register with its [`ReconnectHooks`] so work
/// that failed during an outage is redone once the session reconnects; the
/// hooks only fire if they are the ones owned by the session's default
/// watcher (see [`CoordinationContext::with_reconnect_hooks`]).
#[derive(Clone)]
pub struct CoordinationContext {
    store: Arc<dyn CoordinationStore>,
    config: Arc<HeraldConfig>,
    hooks: Arc<ReconnectHooks>,
}

impl CoordinationContext {
    pub fn new(store: Arc<dyn CoordinationStore>, config: HeraldConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
            hooks: Arc::default(),
        })
    }

    pub fn with_defaults(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            config: Arc::new(HeraldConfig::default()),
            hooks: Arc::default(),
        }
    }

    pub fn with_reconnect_hooks(mut self, hooks: Arc<ReconnectHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn reconnect_hooks(&self) -> &ReconnectHooks {
        &self.hooks
    }

    pub fn store(&self) -> &dyn CoordinationStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &HeraldConfig {
        &self.config
    }

    /// Creates `path` as a persistent node unless it already exists.
    pub fn ensure_namespace(&self, path: &str) -> Result<()> {
        if self.store.exists(path, None)?.is_some() {
            return Ok(());
        }
        match self.store.create(path, b"", CreateMode::Persistent) {
            Ok(_) => {
                debug!("created namespace {path}");
                Ok(())
            }
            // Lost the create race to another process.
            Err(Error::NodeExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
