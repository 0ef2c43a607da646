//! Per-store state living on the worker thread
//!
//! A [`Session`] owns the storage adapter, the identity maps, the
//! serializer, the deserializer and the collector of one open store. It is
//! not `Send`: sessions are created on the worker and parked in a
//! thread-local table, and registries reach them by id through the
//! worker's command queue.

use crate::deserialize::{Deserializer, ExternalResolver};
use crate::gc::{GarbageCollector, GcReport, DEFAULT_MARK_BUDGET};
use crate::identity::{IdentityMaps, DEFAULT_SCALAR_CACHE_LIMIT};
use crate::lazy::LazyHost;
use crate::oid::Oid;
use crate::reduce::TypeRegistry;
use crate::serialize::Serializer;
use crate::storage::{StorageAdapter, StoreStats};
use crate::value::Value;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Weak};

/// Everything the serializer and deserializer share
///
/// Borrows of the cells are kept short and are never held across a
/// recursive store or load.
pub struct Context {
    pub(crate) storage: RefCell<Box<dyn StorageAdapter>>,
    pub(crate) identity: RefCell<IdentityMaps>,
    pub(crate) types: TypeRegistry,
    pub(crate) resolver: Option<Arc<dyn ExternalResolver>>,
    pub(crate) host: Weak<dyn LazyHost>,
    pub(crate) lazy_depth: i32,
}

/// Tunables for a session
#[derive(Clone)]
pub struct SessionOptions {
    pub types: TypeRegistry,
    pub resolver: Option<Arc<dyn ExternalResolver>>,
    /// Depth used when a deferred proxy is forced
    pub lazy_depth: i32,
    pub scalar_cache_limit: usize,
    /// Mark iterations per incremental GC step
    pub mark_budget: usize,
    /// Run incremental GC steps from the idle hook
    pub idle_gc: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            types: TypeRegistry::default(),
            resolver: None,
            lazy_depth: 1,
            scalar_cache_limit: DEFAULT_SCALAR_CACHE_LIMIT,
            mark_budget: DEFAULT_MARK_BUDGET,
            idle_gc: false,
        }
    }
}

pub struct Session {
    cx: Context,
    serializer: Serializer,
    deserializer: Deserializer,
    collector: RefCell<GarbageCollector>,
    idle_gc: bool,
}

impl Session {
    pub fn new(
        storage: Box<dyn StorageAdapter>,
        host: Weak<dyn LazyHost>,
        options: SessionOptions,
    ) -> Self {
        let deserializer = Deserializer::new();
        let deferred = deserializer.deferred();

        let mut identity = IdentityMaps::with_scalar_limit(options.scalar_cache_limit);
        identity.set_eviction_listener(Box::new(move |oid| {
            deferred.borrow_mut().remove(&oid);
        }));

        Self {
            cx: Context {
                storage: RefCell::new(storage),
                identity: RefCell::new(identity),
                types: options.types,
                resolver: options.resolver,
                host,
                lazy_depth: options.lazy_depth,
            },
            serializer: Serializer::new(),
            deserializer,
            collector: RefCell::new(GarbageCollector::new(options.mark_budget)),
            idle_gc: options.idle_gc,
        }
    }

    // ========== Store ==========

    pub fn store(&self, value: &Value, name: Option<&str>) -> Result<Oid> {
        self.collector.borrow_mut().invalidate();
        self.serializer.store(&self.cx, value, name)
    }

    pub fn store_all(&self, values: &[Value], named: &[(String, Value)]) -> Result<Vec<Oid>> {
        self.collector.borrow_mut().invalidate();
        self.serializer.store_all(&self.cx, values, named)
    }

    pub fn remove(&self, value: &Value) -> Result<Option<Oid>> {
        self.collector.borrow_mut().invalidate();
        self.serializer.remove(&self.cx, value)
    }

    pub fn remove_root(&self, name: &str) -> Result<bool> {
        self.collector.borrow_mut().invalidate();
        self.cx.storage.borrow_mut().remove_root(name)
    }

    pub fn commit(&self) -> Result<()> {
        self.cx.storage.borrow_mut().commit()
    }

    // ========== Load ==========

    pub fn load(&self, oid: Oid, depth: i32) -> Result<Value> {
        self.deserializer.load(&self.cx, oid, depth)
    }

    pub fn load_named(&self, name: &str, depth: i32) -> Result<Option<Value>> {
        self.deserializer.load_named(&self.cx, name, depth)
    }

    pub fn load_lazy(&self, oid: Oid) -> Result<Value> {
        self.deserializer.load_lazy(&self.cx, oid)
    }

    /// Oid currently bound to `value` in this session
    pub fn oid_of(&self, value: &Value) -> Option<Oid> {
        match value {
            Value::Proxy(proxy) => Some(proxy.oid()),
            other => self.cx.identity.borrow_mut().find(other),
        }
    }

    pub fn roots(&self) -> Result<Vec<(String, Oid)>> {
        self.cx.storage.borrow().all_roots()
    }

    pub fn root_names(&self) -> Result<Vec<String>> {
        Ok(self.roots()?.into_iter().map(|(name, _)| name).collect())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.cx.storage.borrow().stats()
    }

    // ========== Garbage Collection ==========

    /// One bounded collector step; a report once a cycle completes
    pub fn gc_step(&self) -> Result<Option<GcReport>> {
        self.commit()?;
        let report = {
            let mut storage = self.cx.storage.borrow_mut();
            self.collector.borrow_mut().step(storage.as_mut())?
        };
        if let Some(report) = &report {
            self.after_reap(report)?;
        }
        Ok(report)
    }

    /// A full mark and reap cycle
    pub fn gc_collect(&self) -> Result<GcReport> {
        self.commit()?;
        let report = {
            let mut storage = self.cx.storage.borrow_mut();
            self.collector.borrow_mut().full(storage.as_mut())?
        };
        self.after_reap(&report)?;
        Ok(report)
    }

    fn after_reap(&self, report: &GcReport) -> Result<()> {
        if report.reclaimed == 0 {
            return Ok(());
        }
        let storage = self.cx.storage.borrow();
        let mut failure = None;
        let dropped = self.cx.identity.borrow_mut().retain(|oid| {
            match storage.contains(oid) {
                Ok(present) => present,
                Err(e) => {
                    failure.get_or_insert(e);
                    true
                }
            }
        });
        tracing::debug!("Dropped {} identity bindings of reclaimed oids", dropped);
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========== Lifecycle ==========

    /// Housekeeping run by the worker's idle hook
    pub fn idle(&self) {
        let purged = self.cx.identity.borrow_mut().purge();
        if purged > 0 {
            tracing::trace!("Purged {} dead identity bindings", purged);
        }
        if self.idle_gc {
            if let Err(e) = self.gc_step() {
                tracing::warn!("Idle GC step failed: {}", e);
            }
        }
    }

    /// Discard uncommitted writes and release every binding
    pub fn close(&self) -> Result<()> {
        self.collector.borrow_mut().invalidate();
        self.cx.identity.borrow_mut().forget_all();
        self.cx.storage.borrow_mut().close()
    }
}

// ========== Thread-local session table ==========

thread_local! {
    static SESSIONS: RefCell<HashMap<u64, Rc<Session>>> = RefCell::new(HashMap::new());
}

pub(crate) fn install(id: u64, session: Session) {
    SESSIONS.with(|sessions| {
        sessions.borrow_mut().insert(id, Rc::new(session));
    });
}

pub(crate) fn uninstall(id: u64) -> Option<Rc<Session>> {
    SESSIONS.with(|sessions| sessions.borrow_mut().remove(&id))
}

/// Run `f` against session `id` on the current thread
pub(crate) fn with_session<R>(id: u64, f: impl FnOnce(&Session) -> Result<R>) -> Result<R> {
    // Clone out of the table so `f` may re-enter it
    let session = SESSIONS.with(|sessions| sessions.borrow().get(&id).cloned());
    match session {
        Some(session) => f(&session),
        None => Err(Error::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    struct LocalHost(u64);

    impl LazyHost for LocalHost {
        fn load_lazy(&self, oid: Oid) -> Result<Value> {
            with_session(self.0, |s| s.load_lazy(oid))
        }
    }

    /// Session installed on the test thread, with the host kept alive
    fn local_session() -> (u64, Arc<dyn LazyHost>) {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        let host: Arc<dyn LazyHost> = Arc::new(LocalHost(id));
        let storage = Box::new(SqliteStorage::open_in_memory().unwrap());
        install(id, Session::new(storage, Arc::downgrade(&host), SessionOptions::default()));
        (id, host)
    }

    fn session(id: u64) -> Rc<Session> {
        SESSIONS.with(|sessions| sessions.borrow().get(&id).cloned().unwrap())
    }

    #[test]
    fn test_store_and_load_within_session() {
        let (id, _host) = local_session();
        let s = session(id);
        let list = Value::list(vec![Value::from(1), Value::from("two")]);
        let oid = s.store(&list, Some("l")).unwrap();

        let loaded = s.load(oid, 1).unwrap();
        assert!(loaded.is_identical(&list));
        assert_eq!(s.root_names().unwrap(), vec!["l".to_string()]);
        uninstall(id);
    }

    #[test]
    fn test_deferred_proxy_forces_through_host() {
        let (id, _host) = local_session();
        let s = session(id);
        let inner = Value::list(vec![Value::from(5)]);
        let outer = Value::list(vec![inner]);
        let oid = s.store(&outer, None).unwrap();
        s.cx.identity.borrow_mut().forget_all();

        let shallow = s.load(oid, 0).unwrap();
        assert!(shallow.is_proxy());
        let forced = shallow.resolve().unwrap();
        assert_eq!(forced.len().unwrap(), 1);
        uninstall(id);
    }

    #[test]
    fn test_tuple_cycle_resolves_through_proxy() {
        let (id, _host) = local_session();
        let s = session(id);
        let list = Value::list(vec![]);
        let tuple = Value::tuple(vec![list.clone()]);
        if let Value::Seq(seq) = &list {
            seq.push(tuple.clone());
        }
        let oid = s.store(&tuple, None).unwrap();
        if let Value::Seq(seq) = &list {
            seq.set(0, Value::Null);
        }
        s.cx.identity.borrow_mut().forget_all();

        let loaded = s.load(oid, -1).unwrap();
        let inner = loaded.items().unwrap()[0].clone();
        let back = inner.items().unwrap()[0].clone();
        assert!(back.is_proxy());
        assert!(back.resolve().unwrap().is_identical(&loaded));
        uninstall(id);
    }

    #[test]
    fn test_gc_collect_drops_stale_bindings() {
        let (id, _host) = local_session();
        let s = session(id);
        let doomed = Value::list(vec![Value::from(100), Value::from(200)]);
        let kept = Value::list(vec![Value::from("kept"), Value::from(1)]);
        let doomed_oid = s.store(&doomed, Some("doomed")).unwrap();
        s.store(&kept, Some("kept")).unwrap();
        assert!(s.remove_root("doomed").unwrap());

        let report = s.gc_collect().unwrap();
        assert_eq!(report.reclaimed, 3);
        assert_eq!(s.oid_of(&doomed), None);
        assert!(matches!(s.load(doomed_oid, 1), Err(Error::NotFound(_))));
        uninstall(id);
    }

    #[test]
    fn test_closed_session_is_unreachable() {
        let (id, _host) = local_session();
        uninstall(id);
        assert!(matches!(with_session(id, |_| Ok(())), Err(Error::Closed)));
    }
}
