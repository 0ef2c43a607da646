//! Lazy references and transparent proxies
//!
//! An [`OidRef`] names one stored entity and materializes it on first
//! [`force`](OidRef::force) by calling back into its [`LazyHost`]. The
//! transition from unresolved to resolved happens once; later forces
//! return the memoized value.
//!
//! A [`Proxy`] wraps an `OidRef` so that holders can treat it as the
//! value itself. `Value` accessors force proxies on use. An `OidRef`
//! hands out at most one live proxy at a time.

use crate::oid::Oid;
use crate::value::Value;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Loader a lazy reference calls back into
pub trait LazyHost: Send + Sync {
    fn load_lazy(&self, oid: Oid) -> Result<Value>;
}

pub struct OidRef {
    oid: Oid,
    otype: String,
    host: Option<Weak<dyn LazyHost>>,
    value: Mutex<Option<Value>>,
    proxy: Mutex<Weak<ProxyData>>,
}

impl OidRef {
    pub fn new(oid: Oid, otype: impl Into<String>, host: Weak<dyn LazyHost>) -> Arc<Self> {
        Arc::new(Self {
            oid,
            otype: otype.into(),
            host: Some(host),
            value: Mutex::new(None),
            proxy: Mutex::new(Weak::new()),
        })
    }

    /// A reference with no host; it can only be filled explicitly
    pub fn detached(oid: Oid, otype: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            oid,
            otype: otype.into(),
            host: None,
            value: Mutex::new(None),
            proxy: Mutex::new(Weak::new()),
        })
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn otype(&self) -> &str {
        &self.otype
    }

    /// The resolved value, without loading
    pub fn peek(&self) -> Option<Value> {
        self.value.lock().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Resolve the reference.
    ///
    /// With `autoload` false an unresolved reference returns `None` and
    /// has no side effects.
    pub fn force(&self, autoload: bool) -> Result<Option<Value>> {
        if let Some(value) = self.peek() {
            return Ok(Some(value));
        }
        if !autoload {
            return Ok(None);
        }

        let host = match &self.host {
            Some(weak) => weak.upgrade().ok_or(Error::Closed)?,
            None => return Err(Error::Detached(self.oid)),
        };

        tracing::debug!("Forcing lazy reference {}", self.oid);
        // The lock is not held across the load; loading may re-enter this reference
        let loaded = host.load_lazy(self.oid)?;
        Ok(Some(self.fill(loaded)))
    }

    /// Set the resolved value once; returns the value that won
    pub fn fill(&self, value: Value) -> Value {
        let mut slot = self.value.lock();
        match slot.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                *slot = Some(value.clone());
                value
            }
        }
    }

    /// The live proxy for this reference, creating one if needed
    pub fn proxy(self: &Arc<Self>) -> Proxy {
        let mut slot = self.proxy.lock();
        if let Some(data) = slot.upgrade() {
            return Proxy(data);
        }
        let data = Arc::new(ProxyData {
            target: self.clone(),
        });
        *slot = Arc::downgrade(&data);
        Proxy(data)
    }
}

impl fmt::Debug for OidRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidRef")
            .field("oid", &self.oid)
            .field("otype", &self.otype)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

pub struct ProxyData {
    target: Arc<OidRef>,
}

/// Transparent stand-in for a stored value that loads on first use.
///
/// Proxies are not hashable; equality and display forward to the
/// forced value.
#[derive(Clone)]
pub struct Proxy(Arc<ProxyData>);

impl Proxy {
    pub fn from_arc(data: Arc<ProxyData>) -> Self {
        Self(data)
    }

    /// A proxy that is already resolved to `value`
    pub fn resolved(oid: Oid, value: Value) -> Self {
        let target = OidRef::detached(oid, value.type_name());
        target.fill(value);
        target.proxy()
    }

    pub fn oid(&self) -> Oid {
        self.0.target.oid()
    }

    pub fn otype(&self) -> &str {
        self.0.target.otype()
    }

    pub fn reference(&self) -> &Arc<OidRef> {
        &self.0.target
    }

    /// Load (if needed) and return the wrapped value
    pub fn force(&self) -> Result<Value> {
        self.0
            .target
            .force(true)?
            .ok_or(Error::Detached(self.oid()))
    }

    pub fn peek(&self) -> Option<Value> {
        self.0.target.peek()
    }

    pub fn is_resolved(&self) -> bool {
        self.0.target.is_resolved()
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downgrade(&self) -> Weak<ProxyData> {
        Arc::downgrade(&self.0)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_resolved() { "resolved" } else { "unresolved" };
        write!(f, "Proxy({} {}, {})", self.otype(), self.oid(), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHost {
        loads: AtomicUsize,
    }

    impl LazyHost for CountingHost {
        fn load_lazy(&self, oid: Oid) -> Result<Value> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Value::list(vec![Value::from(oid)]))
        }
    }

    fn host() -> Arc<CountingHost> {
        Arc::new(CountingHost {
            loads: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_force_loads_once() {
        let host = host();
        let weak: Weak<dyn LazyHost> = Arc::downgrade(&(host.clone() as Arc<dyn LazyHost>));
        let oidref = OidRef::new(Oid(1000), "list", weak);

        assert_eq!(oidref.force(false).unwrap(), None);
        assert_eq!(host.loads.load(Ordering::SeqCst), 0);

        let first = oidref.force(true).unwrap().unwrap();
        let second = oidref.force(true).unwrap().unwrap();
        assert!(first.is_identical(&second));
        assert_eq!(host.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_live_proxy() {
        let oidref = OidRef::detached(Oid(1000), "list");
        let a = oidref.proxy();
        let b = oidref.proxy();
        assert_eq!(a.addr(), b.addr());
    }

    #[test]
    fn test_detached_reference_fails_to_force() {
        let proxy = OidRef::detached(Oid(1000), "dict").proxy();
        assert!(matches!(proxy.force(), Err(Error::Detached(Oid(1000)))));
    }

    #[test]
    fn test_dropped_host_reports_closed() {
        let host: Arc<dyn LazyHost> = host();
        let oidref = OidRef::new(Oid(1000), "list", Arc::downgrade(&host));
        drop(host);
        assert!(matches!(oidref.force(true), Err(Error::Closed)));
    }

    #[test]
    fn test_value_accessors_forward_through_proxy() {
        let host = host();
        let dyn_host: Arc<dyn LazyHost> = host.clone();
        let proxy = Value::Proxy(OidRef::new(Oid(1001), "list", Arc::downgrade(&dyn_host)).proxy());

        assert_eq!(proxy.len().unwrap(), 1);
        assert_eq!(proxy.items().unwrap(), vec![Value::from(1001)]);
        assert_eq!(proxy.repr().unwrap(), "[1001]");
        assert_eq!(host.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_proxy_is_unhashable() {
        let proxy = Value::Proxy(Proxy::resolved(Oid(1000), Value::from(1)));
        assert!(matches!(proxy.content_hash(), Err(Error::Unhashable(_))));
    }

    #[test]
    fn test_proxy_cycle_is_detected() {
        let inner = OidRef::detached(Oid(1000), "obj");
        let proxy = inner.proxy();
        inner.fill(Value::Proxy(proxy.clone()));
        let err = Value::Proxy(proxy).repr().unwrap_err();
        assert!(matches!(err, Error::CyclicProxy(Oid(1000))));
    }

    #[test]
    fn test_indirect_proxy_cycle_is_detected() {
        let a = OidRef::detached(Oid(1000), "obj");
        let b = OidRef::detached(Oid(1001), "obj");
        a.fill(Value::Proxy(b.proxy()));
        b.fill(Value::Proxy(a.proxy()));

        let err = Value::Proxy(a.proxy()).resolve().unwrap_err();
        assert!(matches!(err, Error::CyclicProxy(_)));
        assert!(matches!(Value::Proxy(b.proxy()).repr(), Err(Error::CyclicProxy(_))));
        assert!(matches!(Value::Proxy(a.proxy()).len(), Err(Error::CyclicProxy(_))));
    }
}
