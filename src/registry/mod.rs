//! Service registry with a watch-maintained address cache.
//!
//! Each worker registers one ephemeral sequential entry whose payload is its
//! address. Readers get the cached [`AddressSnapshot`]; the cache is rebuilt
//! whenever the registry's child set changes, and every rebuild re-arms the
//! children watch. A rebuild that fails inside the watch handler is retried
//! when the session reconnects.

mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use log::{debug, error, info};

use crate::context::CoordinationContext;
use crate::dispatch::ReconnectHandler;
use crate::store::{join_path, CreateMode, EventType, WatchedEvent, Watcher};
use crate::watch::ChildrenWatch;
use crate::{Error, Result};

pub use snapshot::AddressSnapshot;

struct RegistryInner {
    ctx: CoordinationContext,
    namespace: String,
    registered: Mutex<Option<String>>,
    snapshot: RwLock<Option<AddressSnapshot>>,
    /// Held for the whole refresh; the value is the last generation built.
    refresh: Mutex<u64>,
    /// A handler-side refresh failed; the cache is behind the store.
    stale: AtomicBool,
    children: ChildrenWatch,
}

pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

struct MembershipWatch(Weak<RegistryInner>);

impl Watcher for MembershipWatch {
    fn process(&self, event: WatchedEvent) {
        if event.event_type == EventType::None {
            return;
        }
        let Some(registry) = self.0.upgrade() else {
            return;
        };
        debug!("{:?} on {}, refreshing", event.event_type, registry.namespace);
        registry.refresh_or_defer();
    }
}

impl ReconnectHandler for RegistryInner {
    fn on_reconnect(&self) {
        if self.stale.swap(false, Ordering::AcqRel) {
            info!("connection restored, refreshing {}", self.namespace);
            self.refresh_or_defer();
        }
    }
}

impl ServiceRegistry {
    /// Builds the registry and makes sure its namespace exists.
    pub fn new(ctx: CoordinationContext) -> Result<Self> {
        let namespace = ctx.config().registry_namespace.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| RegistryInner {
            children: ChildrenWatch::new(
                namespace.clone(),
                Arc::new(MembershipWatch(weak.clone())),
            ),
            ctx,
            namespace,
            registered: Mutex::new(None),
            snapshot: RwLock::new(None),
            refresh: Mutex::new(0),
            stale: AtomicBool::new(false),
        });
        let handler: Weak<dyn ReconnectHandler> = Arc::downgrade(&inner) as Weak<_>;
        inner.ctx.reconnect_hooks().register(handler);
        let registry = Self { inner };
        registry.create_namespace()?;
        Ok(registry)
    }

    /// Idempotent: an existing namespace is left alone.
    pub fn create_namespace(&self) -> Result<()> {
        self.inner.ctx.ensure_namespace(&self.inner.namespace)
    }

    /// Publishes `metadata` as this process's membership entry. Once per
    /// session; unregister first to register again.
    pub fn register_self(&self, metadata: impl AsRef<[u8]>) -> Result<String> {
        let mut registered = self.inner.registered()?;
        if let Some(path) = registered.as_ref() {
            return Err(Error::AlreadyRegistered(path.clone()));
        }
        let prefix = self.inner.ctx.config().member_path_prefix();
        let path = self.inner.ctx.store().create(
            &prefix,
            metadata.as_ref(),
            CreateMode::EphemeralSequential,
        )?;
        info!("registered to service registry as {path}");
        *registered = Some(path.clone());
        Ok(path)
    }

    /// Removes this process's entry if it is still present. Calling it again,
    /// or after the session has ended, is a no-op.
    pub fn unregister_self(&self) -> Result<()> {
        let mut registered = self.inner.registered()?;
        let Some(path) = registered.clone() else {
            return Ok(());
        };
        let store = self.inner.ctx.store();
        let outcome = match store.exists(&path, None) {
            Ok(Some(_)) => store.delete(&path),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) | Err(Error::SessionExpired) => {
                info!("unregistered {path} from service registry");
                *registered = None;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the cached snapshot, computing it on first use. Concurrent
    /// first callers share a single computation.
    pub fn get_all_addresses(&self) -> Result<AddressSnapshot> {
        if let Some(snapshot) = self.inner.cached()? {
            return Ok(snapshot);
        }
        let mut generation = self.inner.refresh_lock()?;
        if let Some(snapshot) = self.inner.cached()? {
            return Ok(snapshot);
        }
        self.inner.refresh_locked(&mut generation)
    }

    /// Computes the snapshot now and keeps it current through the children
    /// watch, without registering this process.
    pub fn watch_membership(&self) -> Result<AddressSnapshot> {
        self.inner.refresh()
    }

    /// Snapshot as last computed, without touching the store.
    pub fn cached(&self) -> Result<Option<AddressSnapshot>> {
        self.inner.cached()
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.registered_path(), Ok(Some(_)))
    }

    pub fn registered_path(&self) -> Result<Option<String>> {
        Ok(self.inner.registered()?.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Whether a failed refresh is waiting for the session to reconnect.
    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::Acquire)
    }
}

impl RegistryInner {
    fn registered(&self) -> Result<MutexGuard<'_, Option<String>>> {
        self.registered
            .lock()
            .map_err(|_| Error::LockPoisoned("registry membership"))
    }

    fn refresh_lock(&self) -> Result<MutexGuard<'_, u64>> {
        self.refresh
            .lock()
            .map_err(|_| Error::LockPoisoned("registry refresh"))
    }

    fn cached(&self) -> Result<Option<AddressSnapshot>> {
        self.snapshot
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| Error::LockPoisoned("registry snapshot"))
    }

    fn refresh(&self) -> Result<AddressSnapshot> {
        let mut generation = self.refresh_lock()?;
        self.refresh_locked(&mut generation)
    }

    /// Watch-handler refresh. On failure the children watch may not be armed,
    /// so the next reconnect has to redo it.
    fn refresh_or_defer(&self) {
        if let Err(err) = self.refresh() {
            self.stale.store(true, Ordering::Release);
            error!("registry refresh for {} failed: {err}", self.namespace);
        }
    }

    fn refresh_locked(&self, generation: &mut u64) -> Result<AddressSnapshot> {
        let store = self.ctx.store();
        let children = self.children.observe(store)?;

        let mut addresses = Vec::with_capacity(children.len());
        for child in children {
            let path = join_path(&self.namespace, &child);
            match store.get_data(&path, None)? {
                Some(bytes) => addresses.push(String::from_utf8_lossy(&bytes).into_owned()),
                None => debug!("{path} disappeared during refresh, skipping"),
            }
        }

        *generation += 1;
        let snapshot = AddressSnapshot::new(addresses, *generation);
        *self
            .snapshot
            .write()
            .map_err(|_| Error::LockPoisoned("registry snapshot"))? = Some(snapshot.clone());
        self.stale.store(false, Ordering::Release);
        info!("cluster addresses: {:?}", snapshot.as_slice());
        Ok(snapshot)
    }
}
