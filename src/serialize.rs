//! Serializer - live object graph to storage rows
//!
//! A store call runs in two phases:
//! 1. Walk the graph. Every new composite gets its oid and shape row
//!    immediately and is bound in the identity maps before its children
//!    are visited, so a cycle back to it is an identity hit.
//! 2. Once the work queue has drained, write all edge rows.
//!
//! Core scalars are content-addressed through the literal table; every
//! other kind is identity-addressed.

use crate::oid::{Kind, Oid};
use crate::reduce::{Constructor, ObjectRef, Reduction};
use crate::session::Context;
use crate::storage::Literal;
use crate::value::Value;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;

/// Field names of the mapping row stored for an object
pub const FIELD_ARGS: &str = "args";
pub const FIELD_STATE: &str = "state";
pub const FIELD_LIST_ITEMS: &str = "listitems";
pub const FIELD_DICT_ITEMS: &str = "dictitems";

/// Composite body whose children are still to be stored
enum Pending {
    Ordered(Oid, Vec<Value>),
    Mapping(Oid, Vec<(Value, Value)>),
    Weak(Oid, Option<Value>),
    Object(Oid, Reduction),
}

/// Edge rows ready to be written
enum EdgeWrite {
    Ordered(Oid, Vec<Oid>),
    Mapping(Oid, Vec<(Oid, Oid)>),
    Weak(Oid, Option<Oid>),
}

#[derive(Default)]
pub struct Serializer {
    pending: RefCell<VecDeque<Pending>>,
    allocated: RefCell<Vec<Oid>>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, optionally naming it as a root
    pub fn store(&self, cx: &Context, value: &Value, name: Option<&str>) -> Result<Oid> {
        let result = self.store_flushed(cx, value).and_then(|oid| {
            if let Some(name) = name {
                cx.storage.borrow_mut().set_root(name, oid)?;
                tracing::debug!("Named {} as root '{}'", oid, name);
            }
            Ok(oid)
        });
        self.finish(cx, result)
    }

    /// Store several values, then the named ones; returns their oids in order
    pub fn store_all(
        &self,
        cx: &Context,
        values: &[Value],
        named: &[(String, Value)],
    ) -> Result<Vec<Oid>> {
        let mut oids = Vec::with_capacity(values.len() + named.len());
        for value in values {
            oids.push(self.store(cx, value, None)?);
        }
        for (name, value) in named {
            oids.push(self.store(cx, value, Some(name))?);
        }
        Ok(oids)
    }

    /// Delete the rows of a stored value; returns its former oid
    pub fn remove(&self, cx: &Context, value: &Value) -> Result<Option<Oid>> {
        let oid = match value {
            Value::Proxy(proxy) => Some(proxy.oid()),
            other => cx.identity.borrow_mut().find(other),
        };
        let Some(oid) = oid else {
            return Ok(None);
        };
        cx.storage.borrow_mut().remove_id(oid)?;
        cx.identity.borrow_mut().forget(oid);
        tracing::debug!("Removed {}", oid);
        Ok(Some(oid))
    }

    fn store_flushed(&self, cx: &Context, value: &Value) -> Result<Oid> {
        let oid = self.store_value(cx, value, true)?;
        self.flush(cx)?;
        Ok(oid)
    }

    fn finish(&self, cx: &Context, result: Result<Oid>) -> Result<Oid> {
        let allocated = std::mem::take(&mut *self.allocated.borrow_mut());
        if result.is_err() {
            let dropped = self.pending.borrow().len();
            self.pending.borrow_mut().clear();
            let mut identity = cx.identity.borrow_mut();
            for oid in &allocated {
                identity.forget(*oid);
            }
            tracing::warn!(
                "Store aborted: dropped {} queued bodies, forgot {} new oids",
                dropped,
                allocated.len()
            );
        } else if !allocated.is_empty() {
            tracing::debug!("Stored {} new oids", allocated.len());
        }
        result
    }

    // ========== Graph walk ==========

    fn store_value(&self, cx: &Context, value: &Value, top: bool) -> Result<Oid> {
        if let Value::Proxy(proxy) = value {
            // Unforced proxies already name stored content
            return match proxy.peek() {
                Some(target) => self.store_value(cx, &target, top),
                None => Ok(proxy.oid()),
            };
        }

        let known = cx.identity.borrow_mut().find(value);
        if let Some(oid) = known {
            if top && is_mutable_composite(value) {
                self.encode(cx, value, oid)?;
            }
            return Ok(oid);
        }

        match value {
            Value::Null => self.store_literal(cx, value, &Literal::Null, "null", Kind::Null),
            Value::Bool(b) => {
                self.store_literal(cx, value, &Literal::Integer(*b as i64), "bool", Kind::Literal)
            }
            Value::Int(i) => self.store_literal(cx, value, &Literal::Integer(*i), "int", Kind::Literal),
            Value::Float(f) => self.store_literal(cx, value, &Literal::Real(*f), "float", Kind::Literal),
            Value::Str(s) => {
                self.store_literal(cx, value, &Literal::Text(s.clone()), "str", Kind::Literal)
            }
            Value::Bytes(b) => {
                self.store_literal(cx, value, &Literal::Blob(b.clone()), "bytes", Kind::Literal)
            }
            Value::Opaque(opaque) => {
                let payload = Literal::Blob(opaque.encode()?);
                let oid = self.allocate(cx, value, Kind::PickledLiteral, opaque.otype())?;
                let hash = crate::storage::literal_hash(opaque.otype(), &payload);
                cx.storage
                    .borrow_mut()
                    .put_literal(oid, &payload, hash, opaque.otype())?;
                Ok(oid)
            }
            Value::External(external) => {
                let oid = self.allocate(cx, value, Kind::External, "external")?;
                cx.storage.borrow_mut().set_external(oid, external.url())?;
                Ok(oid)
            }
            Value::Tuple(_) => {
                let oid = self.allocate(cx, value, Kind::Tuple, "tuple")?;
                self.encode(cx, value, oid)?;
                Ok(oid)
            }
            Value::Seq(seq) => {
                let oid = self.allocate(cx, value, Kind::ListLike, seq.kind().otype())?;
                self.encode(cx, value, oid)?;
                Ok(oid)
            }
            Value::Dict(_) => {
                let oid = self.allocate(cx, value, Kind::Mapping, "dict")?;
                self.encode(cx, value, oid)?;
                Ok(oid)
            }
            Value::WeakRef(_) => {
                let oid = self.allocate(cx, value, Kind::Weakref, "weakref")?;
                self.encode(cx, value, oid)?;
                Ok(oid)
            }
            Value::Object(obj) => {
                let reduction = checked_reduction(cx, obj)?;
                let otype = obj.otype();
                let oid = self.allocate(cx, value, Kind::Object, &otype)?;
                self.pending
                    .borrow_mut()
                    .push_back(Pending::Object(oid, reduction));
                Ok(oid)
            }
            Value::Proxy(proxy) => Ok(proxy.oid()),
        }
    }

    fn store_literal(
        &self,
        cx: &Context,
        value: &Value,
        literal: &Literal,
        value_type: &str,
        kind: Kind,
    ) -> Result<Oid> {
        let oid = cx
            .storage
            .borrow_mut()
            .set_literal(literal, value_type, kind)?;
        cx.identity.borrow_mut().bind(value, oid, false)?;
        Ok(oid)
    }

    /// Allocate an oid, write its shape and bind it before any child is visited
    fn allocate(&self, cx: &Context, value: &Value, kind: Kind, otype: &str) -> Result<Oid> {
        let oid = {
            let mut storage = cx.storage.borrow_mut();
            let oid = storage.allocate_id()?;
            storage.set_shape(oid, kind, otype)?;
            oid
        };
        cx.identity.borrow_mut().bind(value, oid, false)?;
        self.allocated.borrow_mut().push(oid);
        tracing::trace!("Allocated {} as {} {}", oid, kind, otype);
        Ok(oid)
    }

    /// Allocate an oid for an args, listitems or dictitems piece; these are never bound.
    /// The state piece goes through `store_value` so a state shared with the graph keeps its oid.
    fn allocate_piece(&self, cx: &Context, kind: Kind, otype: &str) -> Result<Oid> {
        let mut storage = cx.storage.borrow_mut();
        let oid = storage.allocate_id()?;
        storage.set_shape(oid, kind, otype)?;
        Ok(oid)
    }

    /// Queue the body of a composite under `oid`
    fn encode(&self, cx: &Context, value: &Value, oid: Oid) -> Result<()> {
        let body = match value {
            Value::Tuple(tuple) => Pending::Ordered(oid, tuple.items().to_vec()),
            Value::Seq(seq) => Pending::Ordered(oid, seq.items()),
            Value::Dict(dict) => Pending::Mapping(oid, dict.entries()),
            Value::WeakRef(weak) => Pending::Weak(oid, weak.upgrade()),
            Value::Object(obj) => Pending::Object(oid, checked_reduction(cx, obj)?),
            other => {
                return Err(Error::UnsupportedType(format!(
                    "{} has no composite body",
                    other.type_name()
                )));
            }
        };
        self.pending.borrow_mut().push_back(body);
        Ok(())
    }

    fn flush(&self, cx: &Context) -> Result<()> {
        let mut writes = Vec::new();
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some(item) = next else { break };
            writes.push(self.resolve_children(cx, item)?);
        }

        let mut storage = cx.storage.borrow_mut();
        for write in &writes {
            match write {
                EdgeWrite::Ordered(oid, values) => storage.set_ordered(*oid, values)?,
                EdgeWrite::Mapping(oid, pairs) => storage.set_mapping(*oid, pairs)?,
                EdgeWrite::Weak(oid, target) => storage.set_weakref(*oid, *target)?,
            }
        }
        if !writes.is_empty() {
            tracing::debug!("Flushed {} edge sets", writes.len());
        }
        Ok(())
    }

    fn resolve_children(&self, cx: &Context, item: Pending) -> Result<EdgeWrite> {
        match item {
            Pending::Ordered(oid, items) => {
                let values = items
                    .iter()
                    .map(|v| self.store_value(cx, v, false))
                    .collect::<Result<Vec<_>>>()?;
                Ok(EdgeWrite::Ordered(oid, values))
            }
            Pending::Mapping(oid, pairs) => {
                let mut edges = Vec::with_capacity(pairs.len());
                for (key, value) in &pairs {
                    edges.push((self.store_value(cx, key, false)?, self.store_value(cx, value, false)?));
                }
                Ok(EdgeWrite::Mapping(oid, edges))
            }
            Pending::Weak(oid, target) => {
                let target = match target {
                    Some(target) => Some(self.store_value(cx, &target, false)?),
                    None => None,
                };
                Ok(EdgeWrite::Weak(oid, target))
            }
            Pending::Object(oid, reduction) => {
                let fields = self.store_pieces(cx, reduction)?;
                Ok(EdgeWrite::Mapping(oid, fields))
            }
        }
    }

    /// Store each non-empty reduction piece as its own composite
    fn store_pieces(&self, cx: &Context, reduction: Reduction) -> Result<Vec<(Oid, Oid)>> {
        let mut fields = Vec::new();

        if !reduction.args.is_empty() {
            let piece = self.allocate_piece(cx, Kind::Tuple, "tuple")?;
            self.pending
                .borrow_mut()
                .push_back(Pending::Ordered(piece, reduction.args));
            fields.push((self.field(cx, FIELD_ARGS)?, piece));
        }
        if let Some(state) = reduction.state {
            let piece = self.store_value(cx, &state, false)?;
            fields.push((self.field(cx, FIELD_STATE)?, piece));
        }
        if let Some(items) = reduction.list_items.filter(|items| !items.is_empty()) {
            let piece = self.allocate_piece(cx, Kind::ListLike, "list")?;
            self.pending
                .borrow_mut()
                .push_back(Pending::Ordered(piece, items));
            fields.push((self.field(cx, FIELD_LIST_ITEMS)?, piece));
        }
        if let Some(items) = reduction.dict_items.filter(|items| !items.is_empty()) {
            let piece = self.allocate_piece(cx, Kind::Mapping, "dict")?;
            self.pending
                .borrow_mut()
                .push_back(Pending::Mapping(piece, items));
            fields.push((self.field(cx, FIELD_DICT_ITEMS)?, piece));
        }
        Ok(fields)
    }

    fn field(&self, cx: &Context, name: &str) -> Result<Oid> {
        self.store_value(cx, &Value::str(name), false)
    }
}

/// Containers whose contents can change after they were stored
fn is_mutable_composite(value: &Value) -> bool {
    matches!(value, Value::Seq(_) | Value::Dict(_) | Value::Object(_))
}

/// Reduce `obj` and check it against the supported constructor convention
fn checked_reduction(cx: &Context, obj: &ObjectRef) -> Result<Reduction> {
    let reduction = obj.reduce()?;
    let otype = obj.otype();
    match &reduction.constructor {
        Constructor::Named(function) => {
            return Err(Error::UnsupportedReduction(format!(
                "{} reduces through '{}'",
                otype, function
            )));
        }
        Constructor::NewInstance(declared) if *declared != otype => {
            return Err(Error::ReductionProtocol(format!(
                "reduction of {} constructs {}",
                otype, declared
            )));
        }
        Constructor::NewInstance(_) => {}
    }
    if reduction
        .args
        .iter()
        .any(|arg| matches!(arg, Value::Object(inner) if inner.ptr_eq(obj)))
    {
        return Err(Error::ReductionProtocol(format!(
            "constructor arguments of {} include the instance itself",
            otype
        )));
    }
    if !cx.types.contains(&otype) {
        return Err(Error::UnsupportedType(otype));
    }
    Ok(reduction)
}
