//! Registry - the public face of an open store
//!
//! A [`Registry`] is a cheap, thread-safe handle. All work is forwarded to
//! the session it owns on the worker thread; values cross the boundary as
//! shared `Arc` graphs, so the objects handed back by `load` keep their
//! identity across calls.

use crate::config::OidstoreConfig;
use crate::deserialize::ExternalResolver;
use crate::gc::{GcReport, DEFAULT_MARK_BUDGET};
use crate::identity::DEFAULT_SCALAR_CACHE_LIMIT;
use crate::lazy::LazyHost;
use crate::oid::Oid;
use crate::reduce::TypeRegistry;
use crate::session::{self, Session, SessionOptions};
use crate::storage::{SqliteStorage, StorageAdapter, StoreStats};
use crate::value::Value;
use crate::worker::{Worker, WorkerConfig};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// What to load: an oid or a root name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    Oid(Oid),
    Name(String),
}

impl From<Oid> for LoadTarget {
    fn from(oid: Oid) -> Self {
        LoadTarget::Oid(oid)
    }
}

impl From<&str> for LoadTarget {
    fn from(name: &str) -> Self {
        LoadTarget::Name(name.to_string())
    }
}

impl From<String> for LoadTarget {
    fn from(name: String) -> Self {
        LoadTarget::Name(name)
    }
}

/// Options for opening a registry
#[derive(Clone)]
pub struct RegistryOptions {
    /// Database file; `None` opens an in-memory store
    pub path: Option<PathBuf>,
    pub dbid: Option<String>,
    pub types: TypeRegistry,
    pub resolver: Option<Arc<dyn ExternalResolver>>,
    /// Shared worker; a private one is spawned when unset
    pub worker: Option<Worker>,
    pub idle_timeout: Duration,
    pub idle_gc: bool,
    /// Depth used by [`Registry::load`]
    pub default_depth: i32,
    /// Depth used when a deferred proxy is forced
    pub lazy_depth: i32,
    pub scalar_cache_limit: usize,
    pub mark_budget: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            path: None,
            dbid: None,
            types: TypeRegistry::default(),
            resolver: None,
            worker: None,
            idle_timeout: Duration::from_millis(1000),
            idle_gc: false,
            default_depth: 1,
            lazy_depth: 1,
            scalar_cache_limit: DEFAULT_SCALAR_CACHE_LIMIT,
            mark_budget: DEFAULT_MARK_BUDGET,
        }
    }
}

impl RegistryOptions {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_config(config: &OidstoreConfig) -> Self {
        Self {
            path: Some(config.database.clone()),
            dbid: config.dbid.clone(),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            idle_gc: config.idle_gc,
            default_depth: config.default_depth,
            lazy_depth: config.lazy_depth,
            scalar_cache_limit: config.scalar_cache_limit,
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExternalResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_worker(mut self, worker: Worker) -> Self {
        self.worker = Some(worker);
        self
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            types: self.types.clone(),
            resolver: self.resolver.clone(),
            lazy_depth: self.lazy_depth,
            scalar_cache_limit: self.scalar_cache_limit,
            mark_budget: self.mark_budget,
            idle_gc: self.idle_gc,
        }
    }
}

/// Loader behind the proxies handed out by one registry
struct RegistryHost {
    id: u64,
    worker: Worker,
}

impl LazyHost for RegistryHost {
    fn load_lazy(&self, oid: Oid) -> Result<Value> {
        let id = self.id;
        self.worker
            .call(move || session::with_session(id, |s| s.load_lazy(oid)))
    }
}

pub struct Registry {
    id: u64,
    worker: Worker,
    owns_worker: bool,
    hook: u64,
    default_depth: i32,
    closed: AtomicBool,
    // Proxies hold weak handles on this; dropping the registry detaches them
    _host: Arc<dyn LazyHost>,
}

impl Registry {
    /// Open (or create) a store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(RegistryOptions::at(path.as_ref()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_with(RegistryOptions::default())
    }

    pub fn open_with(options: RegistryOptions) -> Result<Self> {
        let path = options.path.clone();
        let dbid = options.dbid.clone();
        Self::build(options, move || {
            let mut storage = match &path {
                Some(path) => SqliteStorage::open(path)?,
                None => SqliteStorage::open_in_memory()?,
            };
            if let Some(dbid) = dbid {
                storage.set_dbid(&dbid)?;
            }
            Ok(Box::new(storage) as Box<dyn StorageAdapter>)
        })
    }

    /// Run a registry over any storage adapter
    pub fn with_storage(storage: Box<dyn StorageAdapter>, options: RegistryOptions) -> Result<Self> {
        Self::build(options, move || Ok(storage))
    }

    fn build<F>(options: RegistryOptions, make_storage: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn StorageAdapter>> + Send + 'static,
    {
        let (worker, owns_worker) = match options.worker.clone() {
            Some(worker) => (worker, false),
            None => {
                let worker = Worker::spawn(WorkerConfig {
                    idle_timeout: options.idle_timeout,
                    ..WorkerConfig::default()
                })?;
                (worker, true)
            }
        };

        let id = NEXT_REGISTRY_ID.fetch_add(1, Ordering::SeqCst);
        let host: Arc<dyn LazyHost> = Arc::new(RegistryHost {
            id,
            worker: worker.clone(),
        });
        let weak_host: Weak<dyn LazyHost> = Arc::downgrade(&host);
        let session_options = options.session_options();

        let installed = worker.call(move || {
            let storage = make_storage()?;
            session::install(id, Session::new(storage, weak_host, session_options));
            Ok(())
        });
        if let Err(e) = installed {
            if owns_worker {
                let _ = worker.close();
            }
            return Err(e);
        }

        let hook = worker.connect(
            move || {
                let _ = session::with_session(id, |s| {
                    s.idle();
                    Ok(())
                });
            },
            move || {
                if let Some(s) = session::uninstall(id) {
                    if let Err(e) = s.close() {
                        tracing::warn!("Failed to close session {}: {}", id, e);
                    }
                }
            },
        )?;

        tracing::info!("Opened registry {}", id);
        Ok(Self {
            id,
            worker,
            owns_worker,
            hook,
            default_depth: options.default_depth,
            closed: AtomicBool::new(false),
            _host: host,
        })
    }

    fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Session) -> Result<R> + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let id = self.id;
        self.worker.call(move || session::with_session(id, f))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    // ========== Store ==========

    /// Store `value`, optionally under root `name`; returns its oid
    pub fn store(&self, value: &Value, name: Option<&str>) -> Result<Oid> {
        let value = value.clone();
        let name = name.map(str::to_string);
        self.run(move |s| s.store(&value, name.as_deref()))
    }

    /// Store several values and named roots in one command
    pub fn store_all(&self, values: &[Value], named: &[(String, Value)]) -> Result<Vec<Oid>> {
        let values = values.to_vec();
        let named = named.to_vec();
        self.run(move |s| s.store_all(&values, &named))
    }

    /// Delete a stored value's rows; `None` if it was never stored
    pub fn remove(&self, value: &Value) -> Result<Option<Oid>> {
        let value = value.clone();
        self.run(move |s| s.remove(&value))
    }

    pub fn remove_root(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.run(move |s| s.remove_root(&name))
    }

    pub fn commit(&self) -> Result<()> {
        self.run(|s| s.commit())
    }

    // ========== Load ==========

    /// Load at the default depth
    pub fn load(&self, target: impl Into<LoadTarget>) -> Result<Value> {
        self.load_depth(target, self.default_depth)
    }

    /// Load with an explicit depth; `-1` loads the whole reachable graph
    pub fn load_depth(&self, target: impl Into<LoadTarget>, depth: i32) -> Result<Value> {
        match target.into() {
            LoadTarget::Oid(oid) => self.run(move |s| s.load(oid, depth)),
            LoadTarget::Name(name) => self
                .run({
                    let name = name.clone();
                    move |s| s.load_named(&name, depth)
                })?
                .ok_or(Error::RootNotFound(name)),
        }
    }

    /// Load a root, or `None` when no root has that name
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        let name = name.to_string();
        let depth = self.default_depth;
        self.run(move |s| s.load_named(&name, depth))
    }

    /// Oid bound to `value` in this registry, if any
    pub fn oid_of(&self, value: &Value) -> Result<Option<Oid>> {
        let value = value.clone();
        self.run(move |s| Ok(s.oid_of(&value)))
    }

    pub fn all_root_names(&self) -> Result<Vec<String>> {
        self.run(|s| s.root_names())
    }

    pub fn roots(&self) -> Result<Vec<(String, Oid)>> {
        self.run(|s| s.roots())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.run(|s| s.stats())
    }

    // ========== Garbage Collection ==========

    /// One incremental collector step
    pub fn gc(&self) -> Result<Option<GcReport>> {
        self.run(|s| s.gc_step())
    }

    /// A full collection cycle
    pub fn gc_collect(&self) -> Result<GcReport> {
        self.run(|s| s.gc_collect())
    }

    // ========== Lifecycle ==========

    /// Close the session, discarding uncommitted writes
    ///
    /// Fails with [`Error::CloseFromWorker`] when called from inside a
    /// worker command.
    pub fn close(&self) -> Result<()> {
        if self.worker.is_current() {
            return Err(Error::CloseFromWorker);
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.worker.disconnect(self.hook);
        let id = self.id;
        let result = self.worker.call(move || match session::uninstall(id) {
            Some(s) => s.close(),
            None => Ok(()),
        });
        if self.owns_worker {
            self.worker.close()?;
        }
        tracing::info!("Closed registry {}", id);
        result
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.worker.is_current() {
            self.closed.store(true, Ordering::SeqCst);
            self.worker.disconnect(self.hook);
            if let Some(s) = session::uninstall(self.id) {
                let _ = s.close();
            }
            return;
        }
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close registry {}: {}", self.id, e);
        }
    }
}
