mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use herald::{
    session_watcher, CoordinationContext, CoordinationStore, CreateMode, Error, MemoryEnsemble,
    MemorySession, NodeStat, ServiceRegistry, Watcher,
};

use common::{quiet_watcher, wait_until, SETTLE};

fn registry_on(ensemble: &MemoryEnsemble) -> (Arc<MemorySession>, ServiceRegistry) {
    let session = ensemble.connect(quiet_watcher()).expect("connect");
    let ctx = CoordinationContext::with_defaults(session.clone());
    let registry = ServiceRegistry::new(ctx).expect("registry");
    (session, registry)
}

/// Like `registry_on`, but reconnects reach the registry.
fn hooked_registry_on(ensemble: &MemoryEnsemble) -> (Arc<MemorySession>, ServiceRegistry) {
    let (watcher, handles) = session_watcher("observer");
    let session = ensemble.connect(watcher).expect("connect");
    let ctx =
        CoordinationContext::with_defaults(session.clone()).with_reconnect_hooks(handles.hooks);
    let registry = ServiceRegistry::new(ctx).expect("registry");
    (session, registry)
}

fn contains_exactly(registry: &ServiceRegistry, expected: &[&str]) -> bool {
    match registry.cached() {
        Ok(Some(snapshot)) => snapshot.sorted() == expected,
        _ => false,
    }
}

#[test]
fn create_namespace_is_idempotent() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (session, registry) = registry_on(&ensemble);
    registry.create_namespace()?;
    registry.create_namespace()?;
    let (_other_session, _other) = registry_on(&ensemble);
    assert!(session.exists("/service_registry", None)?.is_some());
    assert_eq!(session.stats().create, 1);
    Ok(())
}

#[test]
fn registered_address_is_listed() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (_session, registry) = registry_on(&ensemble);

    let path = registry.register_self("127.0.0.1:8081")?;
    assert_eq!(path, "/service_registry/n_0000000000");
    assert!(registry.is_registered());
    assert_eq!(registry.registered_path()?.as_deref(), Some(path.as_str()));

    let snapshot = registry.get_all_addresses()?;
    assert_eq!(snapshot.sorted(), vec!["127.0.0.1:8081"]);
    assert_eq!(snapshot.generation(), 1);
    Ok(())
}

#[test]
fn empty_registry_yields_empty_snapshot() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (_session, registry) = registry_on(&ensemble);
    assert_eq!(registry.cached()?, None);
    let snapshot = registry.get_all_addresses()?;
    assert!(snapshot.is_empty());
    assert_eq!(registry.cached()?, Some(snapshot));
    Ok(())
}

#[test]
fn concurrent_first_readers_share_one_computation() -> herald::Result<()> {
    const READERS: usize = 8;
    let ensemble = MemoryEnsemble::new();
    let members: Vec<_> = (0..3).map(|_| registry_on(&ensemble)).collect();
    for (idx, (_, member)) in members.iter().enumerate() {
        member.register_self(format!("10.0.0.{idx}:9000"))?;
    }

    let (session, registry) = registry_on(&ensemble);
    let barrier = Barrier::new(READERS);
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..READERS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    registry.get_all_addresses()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("reader thread"))
            .collect()
    });

    let first = results[0].as_ref().expect("snapshot").clone();
    for result in &results {
        assert_eq!(result.as_ref().expect("snapshot"), &first);
    }
    assert_eq!(first.len(), 3);
    let stats = session.stats();
    assert_eq!(stats.get_children, 1);
    assert_eq!(stats.get_data, 3);

    // Later membership changes land in the cache through the watch.
    let (_late_session, late) = registry_on(&ensemble);
    late.register_self("10.0.0.9:9000")?;
    assert!(wait_until(SETTLE, || contains_exactly(
        &registry,
        &["10.0.0.0:9000", "10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.9:9000"],
    )));
    Ok(())
}

#[test]
fn consecutive_changes_are_all_observed() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (_session, observer) = registry_on(&ensemble);
    assert!(observer.watch_membership()?.is_empty());

    let (_a_session, a) = registry_on(&ensemble);
    a.register_self("a:1")?;
    assert!(wait_until(SETTLE, || contains_exactly(&observer, &["a:1"])));

    let (_b_session, b) = registry_on(&ensemble);
    b.register_self("b:1")?;
    assert!(wait_until(SETTLE, || contains_exactly(&observer, &["a:1", "b:1"])));

    a.unregister_self()?;
    assert!(wait_until(SETTLE, || contains_exactly(&observer, &["b:1"])));
    Ok(())
}

#[test]
fn expired_member_leaves_the_snapshot() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (_session, observer) = registry_on(&ensemble);
    let (member_session, member) = registry_on(&ensemble);
    member.register_self("worker:1")?;
    assert_eq!(observer.get_all_addresses()?.sorted(), vec!["worker:1"]);

    ensemble.expire_session(member_session.id())?;
    assert!(wait_until(SETTLE, || contains_exactly(&observer, &[])));

    // Our record is stale but unregistering still succeeds.
    member.unregister_self()?;
    assert!(!member.is_registered());
    Ok(())
}

#[test]
fn refresh_failed_during_outage_is_redone_on_reconnect() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (_session, observer) = hooked_registry_on(&ensemble);
    let (member_session, member) = registry_on(&ensemble);
    member.register_self("m:1")?;
    assert_eq!(observer.watch_membership()?.sorted(), vec!["m:1"]);

    ensemble.set_available(false)?;
    ensemble.expire_session(member_session.id())?;
    assert!(wait_until(SETTLE, || observer.is_stale()));
    assert!(contains_exactly(&observer, &["m:1"]));

    ensemble.set_available(true)?;
    assert!(wait_until(SETTLE, || contains_exactly(&observer, &[])));
    assert!(!observer.is_stale());

    // The watch is armed again.
    let (_next_session, next) = registry_on(&ensemble);
    next.register_self("m:2")?;
    assert!(wait_until(SETTLE, || contains_exactly(&observer, &["m:2"])));
    Ok(())
}

#[test]
fn unregister_is_idempotent() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (session, registry) = registry_on(&ensemble);
    registry.unregister_self()?;

    let path = registry.register_self("x:1")?;
    registry.unregister_self()?;
    registry.unregister_self()?;
    assert!(session.exists(&path, None)?.is_none());

    registry.register_self("x:1")?;
    session.close()?;
    registry.unregister_self()?;
    Ok(())
}

#[test]
fn registering_twice_fails_fast() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (session, registry) = registry_on(&ensemble);
    let path = registry.register_self("x:1")?;
    assert!(matches!(
        registry.register_self("x:1"),
        Err(Error::AlreadyRegistered(existing)) if existing == path
    ));
    assert_eq!(session.get_children("/service_registry", None)?.len(), 1);

    registry.unregister_self()?;
    let again = registry.register_self("x:2")?;
    assert_ne!(again, path);
    Ok(())
}

/// Deletes each member right before its payload is first read, as if the
/// member's session ended between listing and reading.
struct VanishingMember {
    inner: Arc<MemorySession>,
    fired: AtomicBool,
}

impl CoordinationStore for VanishingMember {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> herald::Result<String> {
        self.inner.create(path, data, mode)
    }

    fn exists(
        &self,
        path: &str,
        watch: Option<Arc<dyn Watcher>>,
    ) -> herald::Result<Option<NodeStat>> {
        self.inner.exists(path, watch)
    }

    fn get_children(
        &self,
        path: &str,
        watch: Option<Arc<dyn Watcher>>,
    ) -> herald::Result<Vec<String>> {
        self.inner.get_children(path, watch)
    }

    fn get_data(
        &self,
        path: &str,
        watch: Option<Arc<dyn Watcher>>,
    ) -> herald::Result<Option<Vec<u8>>> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.delete(path)?;
        }
        self.inner.get_data(path, watch)
    }

    fn set_data(&self, path: &str, data: &[u8]) -> herald::Result<NodeStat> {
        self.inner.set_data(path, data)
    }

    fn delete(&self, path: &str) -> herald::Result<()> {
        self.inner.delete(path)
    }
}

#[test]
fn member_vanishing_mid_refresh_is_skipped() -> herald::Result<()> {
    let ensemble = MemoryEnsemble::new();
    let (_first_session, first) = registry_on(&ensemble);
    let (_second_session, second) = registry_on(&ensemble);
    first.register_self("first:1")?;
    second.register_self("second:1")?;

    let session = ensemble.connect(quiet_watcher())?;
    let store = Arc::new(VanishingMember {
        inner: session,
        fired: AtomicBool::new(false),
    });
    let registry = ServiceRegistry::new(CoordinationContext::with_defaults(store))?;

    let snapshot = registry.get_all_addresses()?;
    assert_eq!(snapshot.sorted(), vec!["second:1"]);
    Ok(())
}
