//! Value - the in-memory object graph that gets persisted
//!
//! A [`Value`] is either a flat scalar (content-addressed on store) or a
//! reference-backed node (identity-addressed). Reference-backed nodes are
//! `Arc`-shared so that the same node can appear many times in a graph,
//! including inside itself, and so that graphs can cross the worker
//! thread boundary.
//!
//! Accessors such as [`Value::items`], [`Value::get_attr`] and
//! [`Value::repr`] forward through lazy proxies transparently.

use crate::lazy::Proxy;
use crate::oid::Oid;
use crate::reduce::{ObjectRef, Storable};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

/// A node of a persistable object graph.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Opaque scalar stored as an encoded blob
    Opaque(OpaqueRef),
    /// Immutable ordered sequence
    Tuple(TupleRef),
    /// Mutable sequence: list, set or frozenset
    Seq(SeqRef),
    /// Mapping with hashable keys
    Dict(DictRef),
    WeakRef(WeakRef),
    /// Reduction-based user object
    Object(ObjectRef),
    /// Reference resolved outside this store
    External(ExternalRef),
    /// Not-yet-materialized stored value
    Proxy(Proxy),
}

// ========== Opaque scalars ==========

/// Payload of an opaque scalar, encoded with bincode into the literal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpaquePayload {
    Complex { re: f64, im: f64 },
    Decimal(String),
    Raw(Vec<u8>),
}

#[derive(Debug)]
pub struct Opaque {
    pub otype: String,
    pub payload: OpaquePayload,
}

#[derive(Debug, Clone)]
pub struct OpaqueRef(Arc<Opaque>);

impl OpaqueRef {
    pub fn new(otype: impl Into<String>, payload: OpaquePayload) -> Self {
        Self(Arc::new(Opaque {
            otype: otype.into(),
            payload,
        }))
    }

    pub fn otype(&self) -> &str {
        &self.0.otype
    }

    pub fn payload(&self) -> &OpaquePayload {
        &self.0.payload
    }

    /// Binary encoding written to storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.0.payload)?)
    }

    pub fn decode(otype: &str, bytes: &[u8]) -> Result<Self> {
        let payload: OpaquePayload = bincode::deserialize(bytes)?;
        Ok(Self::new(otype, payload))
    }
}

// ========== Tuples ==========

#[derive(Clone)]
pub struct TupleRef(Arc<[Value]>);

impl TupleRef {
    pub fn new(items: Vec<Value>) -> Self {
        Self(items.into())
    }

    pub fn items(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ========== Sequences ==========

/// Reconstruction container of a list-like stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeqKind {
    List,
    Set,
    FrozenSet,
}

impl SeqKind {
    /// The otype recorded for this container
    pub fn otype(&self) -> &'static str {
        match self {
            SeqKind::List => "list",
            SeqKind::Set => "set",
            SeqKind::FrozenSet => "frozenset",
        }
    }

    pub fn from_otype(otype: &str) -> Option<SeqKind> {
        match otype {
            "list" => Some(SeqKind::List),
            "set" => Some(SeqKind::Set),
            "frozenset" => Some(SeqKind::FrozenSet),
            _ => None,
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, SeqKind::List)
    }
}

pub struct SeqData {
    kind: SeqKind,
    items: RwLock<Vec<Value>>,
}

#[derive(Clone)]
pub struct SeqRef(Arc<SeqData>);

impl SeqRef {
    pub fn new(kind: SeqKind, items: Vec<Value>) -> Self {
        Self(Arc::new(SeqData {
            kind,
            items: RwLock::new(items),
        }))
    }

    pub fn kind(&self) -> SeqKind {
        self.0.kind
    }

    /// Snapshot of the current items
    pub fn items(&self) -> Vec<Value> {
        self.0.items.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.items.read().get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        self.0.items.write().push(value);
    }

    pub fn extend(&self, values: impl IntoIterator<Item = Value>) {
        self.0.items.write().extend(values);
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.0.items.write().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.0.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ========== Mappings ==========

type Pairs = RwLock<Vec<(Value, Value)>>;

#[derive(Clone)]
pub struct DictRef(Arc<Pairs>);

impl DictRef {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Value, Value)>) -> Result<Self> {
        let dict = Self::new();
        for (key, value) in pairs {
            dict.insert(key, value)?;
        }
        Ok(dict)
    }

    /// Insert or replace; keys must be hashable
    pub fn insert(&self, key: Value, value: Value) -> Result<()> {
        key.content_hash()?;
        let entries = self.entries();
        for (index, (existing, _)) in entries.iter().enumerate() {
            if existing.key_eq(&key)? {
                if let Some(slot) = self.0.write().get_mut(index) {
                    slot.1 = value;
                }
                return Ok(());
            }
        }
        self.0.write().push((key, value));
        Ok(())
    }

    /// Append without the hashability and duplicate checks
    pub(crate) fn push_entry(&self, key: Value, value: Value) {
        self.0.write().push((key, value));
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        for (existing, value) in self.entries() {
            if existing.key_eq(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Snapshot of the current entries in insertion order
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.read().clone()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.0.read().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DictRef {
    fn default() -> Self {
        Self::new()
    }
}

// ========== Weak references ==========

/// A non-owning handle to a reference-backed value.
#[derive(Clone)]
pub enum WeakValue {
    Opaque(Weak<Opaque>),
    Tuple(Weak<[Value]>),
    Seq(Weak<SeqData>),
    Dict(Weak<Pairs>),
    WeakRef(Weak<WeakData>),
    Object(Weak<dyn Storable>),
    External(Weak<ExternalData>),
    Proxy(Weak<crate::lazy::ProxyData>),
}

impl WeakValue {
    pub fn upgrade(&self) -> Option<Value> {
        match self {
            WeakValue::Opaque(w) => w.upgrade().map(|a| Value::Opaque(OpaqueRef(a))),
            WeakValue::Tuple(w) => w.upgrade().map(|a| Value::Tuple(TupleRef(a))),
            WeakValue::Seq(w) => w.upgrade().map(|a| Value::Seq(SeqRef(a))),
            WeakValue::Dict(w) => w.upgrade().map(|a| Value::Dict(DictRef(a))),
            WeakValue::WeakRef(w) => w.upgrade().map(|a| Value::WeakRef(WeakRef(a))),
            WeakValue::Object(w) => w.upgrade().map(|a| Value::Object(ObjectRef::from_arc(a))),
            WeakValue::External(w) => w.upgrade().map(|a| Value::External(ExternalRef(a))),
            WeakValue::Proxy(w) => w.upgrade().map(|a| Value::Proxy(Proxy::from_arc(a))),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            WeakValue::Opaque(w) => w.strong_count() > 0,
            WeakValue::Tuple(w) => w.strong_count() > 0,
            WeakValue::Seq(w) => w.strong_count() > 0,
            WeakValue::Dict(w) => w.strong_count() > 0,
            WeakValue::WeakRef(w) => w.strong_count() > 0,
            WeakValue::Object(w) => w.strong_count() > 0,
            WeakValue::External(w) => w.strong_count() > 0,
            WeakValue::Proxy(w) => w.strong_count() > 0,
        }
    }
}

pub struct WeakData {
    target: Option<WeakValue>,
}

/// A weak reference value; its own identity is persisted like any other node.
#[derive(Clone)]
pub struct WeakRef(Arc<WeakData>);

impl WeakRef {
    /// Weakly reference `target`; flat scalars cannot be weakly referenced
    pub fn new(target: &Value) -> Result<Self> {
        let weak = target.downgrade().ok_or_else(|| {
            Error::UnsupportedType(format!("cannot weakly reference {}", target.type_name()))
        })?;
        Ok(Self(Arc::new(WeakData { target: Some(weak) })))
    }

    /// A weak reference whose target is already gone
    pub fn dead() -> Self {
        Self(Arc::new(WeakData { target: None }))
    }

    pub fn upgrade(&self) -> Option<Value> {
        self.0.target.as_ref().and_then(WeakValue::upgrade)
    }
}

// ========== Externals ==========

#[derive(Debug)]
pub struct ExternalData {
    url: String,
}

#[derive(Debug, Clone)]
pub struct ExternalRef(Arc<ExternalData>);

impl ExternalRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self(Arc::new(ExternalData { url: url.into() }))
    }

    pub fn url(&self) -> &str {
        &self.0.url
    }
}

// ========== Value ==========

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn complex(re: f64, im: f64) -> Value {
        Value::Opaque(OpaqueRef::new("complex", OpaquePayload::Complex { re, im }))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(TupleRef::new(items))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::Seq(SeqRef::new(SeqKind::List, items))
    }

    pub fn set(items: Vec<Value>) -> Value {
        Value::Seq(SeqRef::new(SeqKind::Set, items))
    }

    pub fn frozenset(items: Vec<Value>) -> Value {
        Value::Seq(SeqRef::new(SeqKind::FrozenSet, items))
    }

    pub fn dict(pairs: impl IntoIterator<Item = (Value, Value)>) -> Result<Value> {
        Ok(Value::Dict(DictRef::from_pairs(pairs)?))
    }

    pub fn weak(target: &Value) -> Result<Value> {
        Ok(Value::WeakRef(WeakRef::new(target)?))
    }

    pub fn object<T: Storable>(obj: T) -> Value {
        Value::Object(ObjectRef::new(obj))
    }

    pub fn external(url: impl Into<String>) -> Value {
        Value::External(ExternalRef::new(url))
    }

    /// Short type name, matching the otype recorded for builtin kinds
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::Bytes(_) => "bytes".to_string(),
            Value::Opaque(o) => o.otype().to_string(),
            Value::Tuple(_) => "tuple".to_string(),
            Value::Seq(s) => s.kind().otype().to_string(),
            Value::Dict(_) => "dict".to_string(),
            Value::WeakRef(_) => "weakref".to_string(),
            Value::Object(o) => o.otype(),
            Value::External(_) => "external".to_string(),
            Value::Proxy(_) => "proxy".to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Value::Proxy(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Address of the shared node, `None` for flat scalars
    pub fn addr(&self) -> Option<usize> {
        match self {
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Str(_)
            | Value::Bytes(_) => None,
            Value::Opaque(o) => Some(Arc::as_ptr(&o.0) as *const () as usize),
            Value::Tuple(t) => Some(Arc::as_ptr(&t.0) as *const () as usize),
            Value::Seq(s) => Some(Arc::as_ptr(&s.0) as *const () as usize),
            Value::Dict(d) => Some(Arc::as_ptr(&d.0) as *const () as usize),
            Value::WeakRef(w) => Some(Arc::as_ptr(&w.0) as *const () as usize),
            Value::Object(o) => Some(o.addr()),
            Value::External(e) => Some(Arc::as_ptr(&e.0) as *const () as usize),
            Value::Proxy(p) => Some(p.addr()),
        }
    }

    /// Identity comparison: same shared node, or equal flat scalars
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self.addr(), other.addr()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.identity_key() == other.identity_key(),
            _ => false,
        }
    }

    /// Non-owning handle for reference-backed values
    pub fn downgrade(&self) -> Option<WeakValue> {
        match self {
            Value::Opaque(o) => Some(WeakValue::Opaque(Arc::downgrade(&o.0))),
            Value::Tuple(t) => Some(WeakValue::Tuple(Arc::downgrade(&t.0))),
            Value::Seq(s) => Some(WeakValue::Seq(Arc::downgrade(&s.0))),
            Value::Dict(d) => Some(WeakValue::Dict(Arc::downgrade(&d.0))),
            Value::WeakRef(w) => Some(WeakValue::WeakRef(Arc::downgrade(&w.0))),
            Value::Object(o) => Some(WeakValue::Object(o.downgrade())),
            Value::External(e) => Some(WeakValue::External(Arc::downgrade(&e.0))),
            Value::Proxy(p) => Some(WeakValue::Proxy(p.downgrade())),
            _ => None,
        }
    }

    // ========== Proxy forwarding ==========

    /// Follow proxies to the concrete value, failing on proxy cycles
    pub fn resolve(&self) -> Result<Value> {
        let mut current = self.clone();
        let mut seen: Vec<usize> = Vec::new();
        while let Value::Proxy(proxy) = &current {
            let addr = proxy.addr();
            if seen.contains(&addr) {
                return Err(Error::CyclicProxy(proxy.oid()));
            }
            seen.push(addr);
            let next = proxy.force()?;
            current = next;
        }
        Ok(current)
    }

    /// Attribute of an object value
    pub fn get_attr(&self, name: &str) -> Result<Option<Value>> {
        match self.resolve()? {
            Value::Object(obj) => Ok(obj.attribute(name)),
            other => Err(Error::UnsupportedType(format!(
                "{} has no attributes",
                other.type_name()
            ))),
        }
    }

    /// Elements of a sequence, or keys of a mapping
    pub fn items(&self) -> Result<Vec<Value>> {
        match self.resolve()? {
            Value::Tuple(t) => Ok(t.items().to_vec()),
            Value::Seq(s) => Ok(s.items()),
            Value::Dict(d) => Ok(d.keys()),
            Value::Object(obj) => Ok(obj.list_items()),
            other => Err(Error::UnsupportedType(format!(
                "{} is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Item lookup in a mapping
    pub fn get_item(&self, key: &Value) -> Result<Option<Value>> {
        match self.resolve()? {
            Value::Dict(d) => d.get(key),
            Value::Object(obj) => {
                for (k, v) in obj.dict_items() {
                    if k.key_eq(key)? {
                        return Ok(Some(v));
                    }
                }
                Ok(None)
            }
            other => Err(Error::UnsupportedType(format!(
                "{} is not a mapping",
                other.type_name()
            ))),
        }
    }

    pub fn len(&self) -> Result<usize> {
        match self.resolve()? {
            Value::Tuple(t) => Ok(t.len()),
            Value::Seq(s) => Ok(s.len()),
            Value::Dict(d) => Ok(d.len()),
            Value::Str(s) => Ok(s.chars().count()),
            Value::Bytes(b) => Ok(b.len()),
            other => Err(Error::UnsupportedType(format!(
                "{} has no length",
                other.type_name()
            ))),
        }
    }

    // ========== Structural equality ==========

    /// Structural equality that forces proxies and tolerates cycles
    pub fn deep_eq(&self, other: &Value) -> Result<bool> {
        let mut seen = Visited::default();
        eq_inner(self, other, &mut seen)
    }

    /// Mapping-key equality, consistent with [`Value::content_hash`]:
    /// objects and weak references match only by identity
    pub fn key_eq(&self, other: &Value) -> Result<bool> {
        let mut seen = Visited {
            keys: true,
            ..Visited::default()
        };
        eq_inner(self, other, &mut seen)
    }

    // ========== Hashing ==========

    /// Content hash for use as a mapping key.
    ///
    /// Mutable containers and proxies are unhashable.
    pub fn content_hash(&self) -> Result<i64> {
        match self {
            Value::Null => Ok(hash_parts(&[b"null"])),
            Value::Bool(b) => Ok(hash_parts(&[b"bool", &[*b as u8]])),
            Value::Int(i) => Ok(hash_parts(&[b"int", &i.to_le_bytes()])),
            Value::Float(f) => Ok(hash_parts(&[b"float", &f.to_bits().to_le_bytes()])),
            Value::Str(s) => Ok(hash_parts(&[b"str", s.as_bytes()])),
            Value::Bytes(b) => Ok(hash_parts(&[b"bytes", b])),
            Value::Opaque(o) => Ok(hash_parts(&[o.otype().as_bytes(), &o.encode()?])),
            Value::Tuple(t) => {
                let mut parts = Vec::with_capacity(t.len());
                for item in t.items() {
                    parts.push(item.content_hash()?.to_le_bytes());
                }
                let slices: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
                Ok(hash_parts(&[b"tuple", &slices.concat()]))
            }
            Value::Seq(s) if s.kind() == SeqKind::FrozenSet => {
                let mut hashes = Vec::new();
                for item in s.items() {
                    hashes.push(item.content_hash()?);
                }
                hashes.sort_unstable();
                let bytes: Vec<u8> = hashes.iter().flat_map(|h| h.to_le_bytes()).collect();
                Ok(hash_parts(&[b"frozenset", &bytes]))
            }
            Value::WeakRef(_) | Value::Object(_) => {
                let addr = self.addr().unwrap_or_default() as u64;
                Ok(hash_parts(&[b"id", &addr.to_le_bytes()]))
            }
            Value::External(e) => Ok(hash_parts(&[b"external", e.url().as_bytes()])),
            Value::Seq(_) | Value::Dict(_) | Value::Proxy(_) => {
                Err(Error::Unhashable(self.type_name()))
            }
        }
    }

    // ========== Representation ==========

    /// Python-like display text; container cycles print as `[...]`
    pub fn repr(&self) -> Result<String> {
        let mut out = String::new();
        let mut active = Vec::new();
        repr_into(self, &mut out, &mut active)?;
        Ok(out)
    }

    /// JSON rendering for inspection tools; does not force proxies
    pub fn to_json(&self) -> serde_json::Value {
        let mut active = Vec::new();
        json_inner(self, &mut active)
    }
}

/// 64-bit blake3 digest over length-prefixed parts
pub(crate) fn hash_parts(parts: &[&[u8]]) -> i64 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_le_bytes(bytes)
}

/// Address pairs under comparison.
///
/// Every recorded value is held until the comparison ends so an address
/// cannot be reused by a temporary, such as a freshly reduced state.
#[derive(Default)]
struct Visited {
    pairs: HashSet<(usize, usize)>,
    _held: Vec<(Value, Value)>,
    keys: bool,
}

fn eq_inner(a: &Value, b: &Value, seen: &mut Visited) -> Result<bool> {
    let a = a.resolve()?;
    let b = b.resolve()?;
    if seen.keys && matches!(a, Value::Object(_) | Value::WeakRef(_)) {
        return Ok(a.is_identical(&b));
    }
    let mut pair = None;
    if let (Some(pa), Some(pb)) = (a.addr(), b.addr()) {
        if pa == pb {
            return Ok(true);
        }
        // Revisiting a pair means the comparison is already in progress higher up
        if !seen.pairs.insert((pa, pb)) {
            return Ok(true);
        }
        seen._held.push((a.clone(), b.clone()));
        pair = Some((pa, pb));
    }

    let equal = match (&a, &b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Opaque(x), Value::Opaque(y)) => {
            x.otype() == y.otype() && x.payload() == y.payload()
        }
        (Value::Tuple(x), Value::Tuple(y)) => ordered_eq(x.items(), y.items(), seen)?,
        (Value::Seq(x), Value::Seq(y)) => {
            if x.kind().is_ordered() != y.kind().is_ordered() {
                false
            } else if x.kind().is_ordered() {
                ordered_eq(&x.items(), &y.items(), seen)?
            } else {
                unordered_eq(&x.items(), &y.items(), seen)?
            }
        }
        (Value::Dict(x), Value::Dict(y)) => pairs_eq(&x.entries(), &y.entries(), seen)?,
        (Value::WeakRef(x), Value::WeakRef(y)) => match (x.upgrade(), y.upgrade()) {
            (Some(p), Some(q)) => eq_inner(&p, &q, seen)?,
            (None, None) => true,
            _ => false,
        },
        (Value::Object(x), Value::Object(y)) => {
            let rx = x.reduce()?;
            let ry = y.reduce()?;
            x.otype() == y.otype()
                && ordered_eq(&rx.args, &ry.args, seen)?
                && match (&rx.state, &ry.state) {
                    (Some(p), Some(q)) => eq_inner(p, q, seen)?,
                    (None, None) => true,
                    _ => false,
                }
                && ordered_eq(
                    rx.list_items.as_deref().unwrap_or_default(),
                    ry.list_items.as_deref().unwrap_or_default(),
                    seen,
                )?
                && pairs_eq(
                    rx.dict_items.as_deref().unwrap_or_default(),
                    ry.dict_items.as_deref().unwrap_or_default(),
                    seen,
                )?
        }
        (Value::External(x), Value::External(y)) => x.url() == y.url(),
        _ => false,
    };
    // A pair proven unequal must not short-circuit a later visit
    if let (false, Some(pair)) = (equal, pair) {
        seen.pairs.remove(&pair);
    }
    Ok(equal)
}

fn ordered_eq(xs: &[Value], ys: &[Value], seen: &mut Visited) -> Result<bool> {
    if xs.len() != ys.len() {
        return Ok(false);
    }
    for (x, y) in xs.iter().zip(ys) {
        if !eq_inner(x, y, seen)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn unordered_eq(xs: &[Value], ys: &[Value], seen: &mut Visited) -> Result<bool> {
    if xs.len() != ys.len() {
        return Ok(false);
    }
    let mut used = vec![false; ys.len()];
    'outer: for x in xs {
        for (i, y) in ys.iter().enumerate() {
            if !used[i] && eq_inner(x, y, seen)? {
                used[i] = true;
                continue 'outer;
            }
        }
        return Ok(false);
    }
    Ok(true)
}

fn pairs_eq(
    xs: &[(Value, Value)],
    ys: &[(Value, Value)],
    seen: &mut Visited,
) -> Result<bool> {
    if xs.len() != ys.len() {
        return Ok(false);
    }
    'outer: for (xk, xv) in xs {
        for (yk, yv) in ys {
            if eq_inner(xk, yk, seen)? {
                if !eq_inner(xv, yv, seen)? {
                    return Ok(false);
                }
                continue 'outer;
            }
        }
        return Ok(false);
    }
    Ok(true)
}

fn repr_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn repr_items(
    items: &[Value],
    out: &mut String,
    active: &mut Vec<usize>,
) -> Result<()> {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        repr_into(item, out, active)?;
    }
    Ok(())
}

fn repr_pairs(
    pairs: &[(Value, Value)],
    out: &mut String,
    active: &mut Vec<usize>,
) -> Result<()> {
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        repr_into(k, out, active)?;
        out.push_str(": ");
        repr_into(v, out, active)?;
    }
    Ok(())
}

fn repr_into(value: &Value, out: &mut String, active: &mut Vec<usize>) -> Result<()> {
    let value = value.resolve()?;
    if let Some(addr) = value.addr() {
        if active.contains(&addr) {
            out.push_str(match &value {
                Value::Tuple(_) => "(...)",
                Value::Seq(_) => "[...]",
                Value::Dict(_) => "{...}",
                _ => "<...>",
            });
            return Ok(());
        }
        active.push(addr);
    }

    match &value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&repr_float(*f)),
        Value::Str(s) => {
            out.push('\'');
            out.push_str(&s.replace('\\', "\\\\").replace('\'', "\\'"));
            out.push('\'');
        }
        Value::Bytes(b) => out.push_str(&format!("b'{}'", b.escape_ascii())),
        Value::Opaque(o) => match o.payload() {
            OpaquePayload::Complex { re, im } => {
                let sign = if *im < 0.0 { '-' } else { '+' };
                out.push_str(&format!("({}{}{}j)", re, sign, im.abs()));
            }
            OpaquePayload::Decimal(d) => out.push_str(&format!("Decimal('{}')", d)),
            OpaquePayload::Raw(raw) => {
                out.push_str(&format!("<{} {} bytes>", o.otype(), raw.len()))
            }
        },
        Value::Tuple(t) => {
            out.push('(');
            repr_items(t.items(), out, active)?;
            if t.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::Seq(s) => {
            let items = s.items();
            match s.kind() {
                SeqKind::List => {
                    out.push('[');
                    repr_items(&items, out, active)?;
                    out.push(']');
                }
                SeqKind::Set if items.is_empty() => out.push_str("set()"),
                SeqKind::Set => {
                    out.push('{');
                    repr_items(&items, out, active)?;
                    out.push('}');
                }
                SeqKind::FrozenSet => {
                    out.push_str("frozenset({");
                    repr_items(&items, out, active)?;
                    out.push_str("})");
                }
            }
        }
        Value::Dict(d) => {
            out.push('{');
            repr_pairs(&d.entries(), out, active)?;
            out.push('}');
        }
        Value::WeakRef(w) => match w.upgrade() {
            Some(target) => out.push_str(&format!("<weakref to {}>", target.type_name())),
            None => out.push_str("<weakref; dead>"),
        },
        Value::Object(obj) => {
            let reduction = obj.reduce()?;
            out.push('<');
            out.push_str(&obj.otype());
            if let Some(state) = &reduction.state {
                out.push(' ');
                repr_into(state, out, active)?;
            }
            if let Some(items) = &reduction.list_items {
                out.push_str(" [");
                repr_items(items, out, active)?;
                out.push(']');
            }
            if let Some(pairs) = &reduction.dict_items {
                out.push_str(" {");
                repr_pairs(pairs, out, active)?;
                out.push('}');
            }
            out.push('>');
        }
        Value::External(e) => out.push_str(&format!("<external {}>", e.url())),
        Value::Proxy(proxy) => out.push_str(&format!("<proxy {}>", proxy.oid())),
    }

    if value.addr().is_some() {
        active.pop();
    }
    Ok(())
}

fn json_inner(value: &Value, active: &mut Vec<usize>) -> serde_json::Value {
    use serde_json::json;

    if let Some(addr) = value.addr() {
        if active.contains(&addr) {
            return json!("<cycle>");
        }
        active.push(addr);
    }

    let rendered = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::Bytes(b) => json!({ "$bytes": b }),
        Value::Opaque(o) => json!({ "$opaque": o.otype(), "payload": format!("{:?}", o.payload()) }),
        Value::Tuple(t) => {
            serde_json::Value::Array(t.items().iter().map(|v| json_inner(v, active)).collect())
        }
        Value::Seq(s) => {
            let items: Vec<_> = s.items().iter().map(|v| json_inner(v, active)).collect();
            match s.kind() {
                SeqKind::List => serde_json::Value::Array(items),
                kind => json!({ "$type": kind.otype(), "items": items }),
            }
        }
        Value::Dict(d) => {
            let entries: Vec<_> = d
                .entries()
                .iter()
                .map(|(k, v)| json!([json_inner(k, active), json_inner(v, active)]))
                .collect();
            json!({ "$type": "dict", "entries": entries })
        }
        Value::WeakRef(w) => match w.upgrade() {
            Some(target) => json!({ "$weakref": target.type_name() }),
            None => json!({ "$weakref": null }),
        },
        Value::Object(obj) => {
            let state = obj
                .reduce()
                .ok()
                .and_then(|r| r.state)
                .map(|s| json_inner(&s, active))
                .unwrap_or(serde_json::Value::Null);
            json!({ "$type": obj.otype(), "state": state })
        }
        Value::External(e) => json!({ "$external": e.url() }),
        Value::Proxy(p) => match p.peek() {
            Some(target) => json_inner(&target, active),
            None => json!({ "$proxy": p.oid().get() }),
        },
    };

    if value.addr().is_some() {
        active.pop();
    }
    rendered
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match self.deep_eq(other) {
            Ok(equal) => equal,
            Err(e) => {
                tracing::warn!("equality check failed: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Opaque(o) => write!(f, "Opaque({}, {:?})", o.otype(), o.payload()),
            Value::Tuple(t) => write!(f, "Tuple({} items)", t.len()),
            Value::Seq(s) => write!(f, "Seq({}, {} items)", s.kind().otype(), s.len()),
            Value::Dict(d) => write!(f, "Dict({} entries)", d.len()),
            Value::WeakRef(w) => write!(f, "WeakRef(alive: {})", w.upgrade().is_some()),
            Value::Object(o) => write!(f, "Object({})", o.otype()),
            Value::External(e) => write!(f, "External({})", e.url()),
            Value::Proxy(p) => write!(f, "{:?}", p),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr() {
            Ok(text) => f.write_str(&text),
            Err(e) => write!(f, "<unprintable: {}>", e),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Oid> for Value {
    fn from(oid: Oid) -> Self {
        Value::Int(oid.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_repr() {
        assert_eq!(Value::Null.repr().unwrap(), "None");
        assert_eq!(Value::from(true).repr().unwrap(), "True");
        assert_eq!(Value::from(42).repr().unwrap(), "42");
        assert_eq!(Value::from(19.0).repr().unwrap(), "19.0");
        assert_eq!(Value::from("it's").repr().unwrap(), "'it\\'s'");
        assert_eq!(Value::complex(4.0, 2.0).repr().unwrap(), "(4+2j)");
    }

    #[test]
    fn test_container_repr() {
        let dict = Value::dict([
            (Value::from("a"), Value::from(1)),
            (Value::from("b"), Value::list(vec![1.into(), 2.into(), 3.into()])),
        ])
        .unwrap();
        assert_eq!(dict.repr().unwrap(), "{'a': 1, 'b': [1, 2, 3]}");
        assert_eq!(Value::tuple(vec![1.into()]).repr().unwrap(), "(1,)");
        assert_eq!(Value::set(vec![]).repr().unwrap(), "set()");
    }

    #[test]
    fn test_self_containing_list_repr() {
        let list = SeqRef::new(SeqKind::List, vec![1.into()]);
        list.push(Value::Seq(list.clone()));
        assert_eq!(Value::Seq(list).repr().unwrap(), "[1, [...]]");
    }

    #[test]
    fn test_deep_eq_structural() {
        let a = Value::list(vec![1.into(), Value::from("x")]);
        let b = Value::list(vec![1.into(), Value::from("x")]);
        assert!(!a.is_identical(&b));
        assert_eq!(a, b);

        let s1 = Value::set(vec![1.into(), 2.into()]);
        let s2 = Value::frozenset(vec![2.into(), 1.into()]);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_deep_eq_cyclic() {
        let a = SeqRef::new(SeqKind::List, vec![]);
        a.push(Value::Seq(a.clone()));
        let b = SeqRef::new(SeqKind::List, vec![]);
        b.push(Value::Seq(b.clone()));
        assert!(Value::Seq(a).deep_eq(&Value::Seq(b)).unwrap());
    }

    #[test]
    fn test_mutable_keys_are_unhashable() {
        let dict = DictRef::new();
        let err = dict.insert(Value::list(vec![]), Value::Null).unwrap_err();
        assert!(matches!(err, Error::Unhashable(_)));
        dict.insert(Value::tuple(vec![1.into()]), Value::Null).unwrap();
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_dict_insert_replaces_equal_key() {
        let dict = DictRef::new();
        dict.insert("k".into(), 1.into()).unwrap();
        dict.insert("k".into(), 2.into()).unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(&"k".into()).unwrap(), Some(Value::from(2)));
    }

    #[test]
    fn test_weakref_follows_target_lifetime() {
        let target = Value::list(vec![1.into()]);
        let weak = WeakRef::new(&target).unwrap();
        assert!(weak.upgrade().is_some());
        drop(target);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_scalars_cannot_be_weakly_referenced() {
        assert!(matches!(WeakRef::new(&Value::from(1)), Err(Error::UnsupportedType(_))));
    }

    fn point(x: i64) -> Value {
        Value::object(crate::reduce::Instance::new("P").with_attr("x", x))
    }

    #[test]
    fn test_deep_eq_distinguishes_sibling_objects() {
        // Each comparison reduces to fresh state dicts; none may alias an earlier pair
        for _ in 0..50 {
            let a = Value::list(vec![point(1), point(2)]);
            let b = Value::list(vec![point(1), point(3)]);
            assert!(!a.deep_eq(&b).unwrap());
            let c = Value::list(vec![point(1), point(2)]);
            assert!(a.deep_eq(&c).unwrap());
        }
    }

    #[test]
    fn test_failed_pair_is_not_reused() {
        // Set matching tries (p, r) first and fails; the later direct (p, r) must still fail
        let p = Value::tuple(vec![1.into()]);
        let x = Value::tuple(vec![2.into()]);
        let r = Value::tuple(vec![2.into()]);
        let y = Value::tuple(vec![1.into()]);
        let a = Value::list(vec![Value::set(vec![p.clone(), x]), p]);
        let b = Value::list(vec![Value::set(vec![r.clone(), y]), r]);
        assert!(!a.deep_eq(&b).unwrap());
    }

    #[test]
    fn test_object_keys_match_by_identity() {
        let k1 = Value::object(crate::reduce::Instance::new("K"));
        let k2 = Value::object(crate::reduce::Instance::new("K"));
        assert!(k1.deep_eq(&k2).unwrap());
        assert_ne!(k1.content_hash().unwrap(), k2.content_hash().unwrap());

        let dict = DictRef::new();
        dict.insert(k1.clone(), 1.into()).unwrap();
        dict.insert(k2.clone(), 2.into()).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get(&k1).unwrap(), Some(Value::from(1)));
        assert_eq!(dict.get(&k2).unwrap(), Some(Value::from(2)));

        // Objects nested in tuple keys follow the same rule
        let t1 = Value::tuple(vec![k1.clone()]);
        let t2 = Value::tuple(vec![k2]);
        dict.insert(t1.clone(), 3.into()).unwrap();
        assert_eq!(dict.get(&t2).unwrap(), None);
        assert_eq!(dict.get(&Value::tuple(vec![k1])).unwrap(), Some(Value::from(3)));
    }

    #[test]
    fn test_opaque_codec() {
        let value = OpaqueRef::new("complex", OpaquePayload::Complex { re: 4.0, im: 2.0 });
        let bytes = value.encode().unwrap();
        let decoded = OpaqueRef::decode("complex", &bytes).unwrap();
        assert_eq!(decoded.payload(), value.payload());
    }
}
