//! Identity maps - bidirectional value <-> oid bookkeeping for one session
//!
//! The value side is keyed by [`ObjKey`]:
//! - null maps to a single sentinel key
//! - core scalars (bool, int, float, str, bytes) key by type and value
//! - everything else keys by node identity (its shared address)
//!
//! Reference-backed values are held weakly, so the maps never keep a
//! graph alive on their own. Scalars cannot be weakly held and live in a
//! bounded strong cache instead.

use crate::oid::Oid;
use crate::value::{Value, WeakValue};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};

/// Default bound on strongly cached scalar bindings
pub const DEFAULT_SCALAR_CACHE_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Structural key derived from a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjKey {
    Null,
    Scalar(ScalarKey),
    Identity(usize),
}

impl ObjKey {
    /// Scalar keys are content-addressed and cached strongly
    pub fn is_scalar(&self) -> bool {
        !matches!(self, ObjKey::Identity(_))
    }
}

impl Value {
    /// Key under which this value is bound in the identity maps
    pub fn identity_key(&self) -> ObjKey {
        match self {
            Value::Null => ObjKey::Null,
            Value::Bool(b) => ObjKey::Scalar(ScalarKey::Bool(*b)),
            Value::Int(i) => ObjKey::Scalar(ScalarKey::Int(*i)),
            Value::Float(f) => ObjKey::Scalar(ScalarKey::Float(f.to_bits())),
            Value::Str(s) => ObjKey::Scalar(ScalarKey::Str(s.clone())),
            Value::Bytes(b) => ObjKey::Scalar(ScalarKey::Bytes(b.clone())),
            other => ObjKey::Identity(other.addr().unwrap_or_default()),
        }
    }
}

enum Binding {
    Strong(Value),
    Weak(WeakValue),
}

impl Binding {
    fn of(value: &Value) -> Binding {
        match value.downgrade() {
            Some(weak) => Binding::Weak(weak),
            None => Binding::Strong(value.clone()),
        }
    }

    fn get(&self) -> Option<Value> {
        match self {
            Binding::Strong(value) => Some(value.clone()),
            Binding::Weak(weak) => weak.upgrade(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Binding::Strong(_) => true,
            Binding::Weak(weak) => weak.is_alive(),
        }
    }
}

struct Slot {
    key: ObjKey,
    binding: Binding,
}

/// Callback invoked with each oid whose binding was dropped
pub type EvictionListener = Box<dyn FnMut(Oid)>;

pub struct IdentityMaps {
    obj_to_oid: HashMap<ObjKey, Oid>,
    oid_to_obj: HashMap<Oid, Slot>,
    scalar_order: VecDeque<Oid>,
    scalar_limit: usize,
    on_evict: Option<EvictionListener>,
}

impl IdentityMaps {
    pub fn new() -> Self {
        Self::with_scalar_limit(DEFAULT_SCALAR_CACHE_LIMIT)
    }

    pub fn with_scalar_limit(scalar_limit: usize) -> Self {
        Self {
            obj_to_oid: HashMap::new(),
            oid_to_obj: HashMap::new(),
            scalar_order: VecDeque::new(),
            scalar_limit,
            on_evict: None,
        }
    }

    /// Install the listener told about every evicted oid
    pub fn set_eviction_listener(&mut self, listener: EvictionListener) {
        self.on_evict = Some(listener);
    }

    /// Number of live-or-pending bindings
    pub fn len(&self) -> usize {
        self.oid_to_obj.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oid_to_obj.is_empty()
    }

    /// Bind `value` to `oid`.
    ///
    /// Fails with `IdentityConflict` when the value is already bound to a
    /// different oid whose binding is still live, unless `replace` is set.
    pub fn bind(&mut self, value: &Value, oid: Oid, replace: bool) -> Result<()> {
        let key = value.identity_key();

        if let Some(&existing) = self.obj_to_oid.get(&key) {
            if existing != oid {
                let live = self
                    .oid_to_obj
                    .get(&existing)
                    .is_some_and(|slot| slot.key == key && slot.binding.is_alive());
                if live && !replace {
                    return Err(Error::IdentityConflict {
                        key: describe(&key),
                        existing,
                        requested: oid,
                    });
                }
                self.drop_slot(existing);
            }
        }

        // Rebinding an oid to a different value releases the old key
        if let Some(previous) = self.oid_to_obj.get(&oid) {
            if previous.key != key && self.obj_to_oid.get(&previous.key) == Some(&oid) {
                let stale = previous.key.clone();
                self.obj_to_oid.remove(&stale);
            }
        }

        let scalar = key.is_scalar();
        self.obj_to_oid.insert(key.clone(), oid);
        let fresh = self
            .oid_to_obj
            .insert(
                oid,
                Slot {
                    key,
                    binding: Binding::of(value),
                },
            )
            .is_none();

        if scalar && fresh {
            self.scalar_order.push_back(oid);
            self.enforce_scalar_limit();
        }
        Ok(())
    }

    /// Oid bound to `value`, if its binding is still live
    pub fn find(&mut self, value: &Value) -> Option<Oid> {
        let key = value.identity_key();
        let oid = *self.obj_to_oid.get(&key)?;
        let live = match self.oid_to_obj.get(&oid) {
            Some(slot) if slot.key == key => slot.binding.is_alive(),
            _ => false,
        };
        if live {
            Some(oid)
        } else {
            self.obj_to_oid.remove(&key);
            if self.oid_to_obj.get(&oid).is_some_and(|slot| slot.key == key) {
                self.evict(oid);
            }
            None
        }
    }

    /// Cached value for `oid`, if still alive
    pub fn resolve(&mut self, oid: Oid) -> Option<Value> {
        let value = self.oid_to_obj.get(&oid)?.binding.get();
        if value.is_none() {
            self.evict(oid);
        }
        value
    }

    /// Whether `oid` has a binding, live or not
    pub fn contains(&self, oid: Oid) -> bool {
        self.oid_to_obj.contains_key(&oid)
    }

    /// Drop the binding for `oid` without notifying
    pub fn forget(&mut self, oid: Oid) {
        self.drop_slot(oid);
    }

    /// Drop every binding
    pub fn forget_all(&mut self) {
        self.obj_to_oid.clear();
        self.oid_to_obj.clear();
        self.scalar_order.clear();
    }

    /// Evict bindings whose target has been dropped; returns how many
    pub fn purge(&mut self) -> usize {
        let dead: Vec<Oid> = self
            .oid_to_obj
            .iter()
            .filter(|(_, slot)| !slot.binding.is_alive())
            .map(|(oid, _)| *oid)
            .collect();
        for oid in &dead {
            self.evict(*oid);
        }
        dead.len()
    }

    /// Keep only bindings whose oid satisfies `keep`; returns how many were dropped
    pub fn retain(&mut self, mut keep: impl FnMut(Oid) -> bool) -> usize {
        let doomed: Vec<Oid> = self
            .oid_to_obj
            .keys()
            .copied()
            .filter(|oid| !keep(*oid))
            .collect();
        for oid in &doomed {
            self.evict(*oid);
        }
        doomed.len()
    }

    fn enforce_scalar_limit(&mut self) {
        while self.scalar_order.len() > self.scalar_limit {
            let Some(oldest) = self.scalar_order.pop_front() else {
                break;
            };
            if self.oid_to_obj.get(&oldest).is_some_and(|slot| slot.key.is_scalar()) {
                self.evict(oldest);
            }
        }
    }

    fn drop_slot(&mut self, oid: Oid) -> bool {
        let Some(slot) = self.oid_to_obj.remove(&oid) else {
            return false;
        };
        if self.obj_to_oid.get(&slot.key) == Some(&oid) {
            self.obj_to_oid.remove(&slot.key);
        }
        if slot.key.is_scalar() {
            self.scalar_order.retain(|o| *o != oid);
        }
        true
    }

    fn evict(&mut self, oid: Oid) {
        if self.drop_slot(oid) {
            if let Some(listener) = self.on_evict.as_mut() {
                listener(oid);
            }
        }
    }
}

impl Default for IdentityMaps {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(key: &ObjKey) -> String {
    match key {
        ObjKey::Null => "null".to_string(),
        ObjKey::Scalar(scalar) => format!("{:?}", scalar),
        ObjKey::Identity(addr) => format!("object at {:#x}", addr),
    }
}
