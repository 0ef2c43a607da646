//! Deserializer - storage rows back to a live object graph
//!
//! Loads are depth-bounded. `depth` counts how many composite levels are
//! materialized eagerly; `-1` means unbounded. A lazy kind reached at
//! depth zero comes back as a registered [`Proxy`] without any of its
//! edges being read.
//!
//! Containers and objects are registered in the identity maps before
//! their contents are loaded, so a cycle back to them is an identity
//! hit. Tuples are immutable and are registered once built; a cyclic
//! re-entry into a tuple still under construction yields an unregistered
//! proxy that resolves to the tuple afterwards.

use crate::lazy::OidRef;
use crate::oid::{Entry, Kind, Oid};
use crate::reduce::ObjectRef;
use crate::serialize::{FIELD_ARGS, FIELD_DICT_ITEMS, FIELD_LIST_ITEMS, FIELD_STATE};
use crate::session::Context;
use crate::storage::Literal;
use crate::value::{DictRef, OpaqueRef, SeqKind, SeqRef, Value, WeakRef};
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

/// Resolves `external` urls back into values
pub trait ExternalResolver: Send + Sync {
    /// `None` leaves the url unresolved
    fn resolve(&self, url: &str) -> Result<Option<Value>>;
}

/// Pending depths of proxies handed out at depth zero
pub type DeferredRefs = Rc<RefCell<HashMap<Oid, i32>>>;

#[derive(Default)]
pub struct Deserializer {
    deferred: DeferredRefs,
    transitive: RefCell<HashSet<Oid>>,
    /// Reduction pieces under construction, kept out of the identity maps
    pieces: RefCell<HashMap<Oid, Value>>,
    building: RefCell<HashSet<Oid>>,
}

/// Depth used for the children of a node loaded at `depth`
fn child_depth(depth: i32) -> i32 {
    if depth < 0 { -1 } else { (depth - 1).max(0) }
}

impl Deserializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle on the deferred depths, for eviction cleanup
    pub fn deferred(&self) -> DeferredRefs {
        self.deferred.clone()
    }

    /// Load the entity stored under `oid`
    pub fn load(&self, cx: &Context, oid: Oid, depth: i32) -> Result<Value> {
        if let Some(value) = cx.identity.borrow_mut().resolve(oid) {
            return Ok(value);
        }
        let entry = cx.storage.borrow().get_shape(oid)?;
        self.load_entry(cx, &entry, depth)
    }

    /// Load the entity named by root `name`; `None` if no such root
    pub fn load_named(&self, cx: &Context, name: &str, depth: i32) -> Result<Option<Value>> {
        let entry = cx.storage.borrow().get_root(name)?;
        match entry {
            Some(entry) => Ok(Some(self.load_entry(cx, &entry, depth)?)),
            None => Ok(None),
        }
    }

    /// Materialize the target of a lazy reference
    pub fn load_lazy(&self, cx: &Context, oid: Oid) -> Result<Value> {
        let depth = self
            .deferred
            .borrow_mut()
            .remove(&oid)
            .unwrap_or(cx.lazy_depth);

        let cached = cx.identity.borrow_mut().resolve(oid);
        match cached {
            Some(Value::Proxy(proxy)) if proxy.oid() == oid => {}
            Some(value) => return Ok(value),
            None => {}
        }

        let entry = cx.storage.borrow().get_shape(oid)?;
        tracing::debug!("Loading lazy {} {} at depth {}", entry.otype, oid, depth);
        let depth = if depth == 0 { 1 } else { depth };
        self.materialize(cx, &entry, depth, true)
    }

    fn load_entry(&self, cx: &Context, entry: &Entry, depth: i32) -> Result<Value> {
        if let Some(value) = cx.identity.borrow_mut().resolve(entry.oid) {
            return Ok(value);
        }
        if let Some(value) = self.pieces.borrow().get(&entry.oid) {
            return Ok(value.clone());
        }

        if entry.kind.is_lazy() && depth == 0 {
            let reference = OidRef::new(entry.oid, entry.otype.clone(), cx.host.clone());
            let value = Value::Proxy(reference.proxy());
            self.register(cx, entry.oid, &value, false)?;
            self.deferred.borrow_mut().insert(entry.oid, cx.lazy_depth);
            tracing::trace!("Deferred {} {}", entry.otype, entry.oid);
            return Ok(value);
        }

        if entry.kind == Kind::Tuple && self.building.borrow().contains(&entry.oid) {
            let reference = OidRef::new(entry.oid, entry.otype.clone(), cx.host.clone());
            return Ok(Value::Proxy(reference.proxy()));
        }

        self.materialize(cx, entry, depth, false)
    }

    /// Load a reduction piece without registering its own oid
    fn load_piece(&self, cx: &Context, entry: &Entry, depth: i32) -> Result<Value> {
        let cached = cx.identity.borrow_mut().resolve(entry.oid);
        if let Some(value) = cached {
            if !value.is_proxy() {
                return Ok(value);
            }
        }
        if let Some(value) = self.pieces.borrow().get(&entry.oid) {
            return Ok(value.clone());
        }

        let depth = if depth == 0 { 1 } else { depth };
        self.transitive.borrow_mut().insert(entry.oid);
        let result = self.materialize(cx, entry, depth, false);
        self.transitive.borrow_mut().remove(&entry.oid);
        self.pieces.borrow_mut().remove(&entry.oid);
        result
    }

    fn register(&self, cx: &Context, oid: Oid, value: &Value, replace: bool) -> Result<()> {
        // A piece that reaches itself gets the value under construction back
        if self.transitive.borrow().contains(&oid) {
            self.pieces.borrow_mut().insert(oid, value.clone());
            return Ok(());
        }
        cx.identity.borrow_mut().bind(value, oid, replace)
    }

    fn materialize(&self, cx: &Context, entry: &Entry, depth: i32, replace: bool) -> Result<Value> {
        let oid = entry.oid;
        let child = child_depth(depth);

        match entry.kind {
            Kind::Null => {
                let value = Value::Null;
                self.register(cx, oid, &value, replace)?;
                Ok(value)
            }
            Kind::Literal => {
                let literal = cx.storage.borrow().get_literal(oid)?;
                let value = literal_value(&entry.otype, literal)?;
                self.register(cx, oid, &value, replace)?;
                Ok(value)
            }
            Kind::PickledLiteral => {
                let value = match cx.storage.borrow().get_literal(oid)? {
                    Literal::Blob(bytes) => Value::Opaque(OpaqueRef::decode(&entry.otype, &bytes)?),
                    other => {
                        return Err(Error::TypeResolution(format!(
                            "{} payload stored as {:?}",
                            entry.otype, other
                        )));
                    }
                };
                self.register(cx, oid, &value, replace)?;
                Ok(value)
            }
            Kind::External => {
                let url = cx
                    .storage
                    .borrow()
                    .get_external(oid)?
                    .ok_or(Error::NotFound(oid))?;
                let resolved = match &cx.resolver {
                    Some(resolver) => resolver.resolve(&url)?,
                    None => None,
                };
                let value = resolved.unwrap_or_else(|| Value::external(url));
                self.register(cx, oid, &value, replace)?;
                Ok(value)
            }
            Kind::Weakref => {
                let target = cx.storage.borrow().get_weakref(oid)?;
                let value = match target {
                    Some(target) => {
                        let target = self.load_entry(cx, &target, child)?;
                        match target.downgrade() {
                            Some(_) => Value::WeakRef(WeakRef::new(&target)?),
                            None => Value::WeakRef(WeakRef::dead()),
                        }
                    }
                    None => Value::WeakRef(WeakRef::dead()),
                };
                self.register(cx, oid, &value, replace)?;
                Ok(value)
            }
            Kind::Tuple => {
                let entries = cx.storage.borrow().get_ordered(oid)?;
                self.building.borrow_mut().insert(oid);
                let items = self.load_all(cx, &entries, child);
                self.building.borrow_mut().remove(&oid);
                let value = Value::tuple(items?);
                self.register(cx, oid, &value, replace)?;
                Ok(value)
            }
            Kind::ListLike => {
                let kind = SeqKind::from_otype(&entry.otype)
                    .ok_or_else(|| Error::TypeResolution(entry.otype.clone()))?;
                let seq = SeqRef::new(kind, Vec::new());
                let value = Value::Seq(seq.clone());
                self.register(cx, oid, &value, replace)?;

                let entries = cx.storage.borrow().get_ordered(oid)?;
                seq.extend(self.load_all(cx, &entries, child)?);
                Ok(value)
            }
            Kind::Mapping => {
                if entry.otype != "dict" {
                    return Err(Error::TypeResolution(entry.otype.clone()));
                }
                let dict = DictRef::new();
                let value = Value::Dict(dict.clone());
                self.register(cx, oid, &value, replace)?;

                let pairs = cx.storage.borrow().get_mapping(oid)?;
                let key_depth = if child == 0 { 1 } else { child };
                for (key, item) in &pairs {
                    let key = self.load_entry(cx, key, key_depth)?.resolve()?;
                    let item = self.load_entry(cx, item, child)?;
                    dict.push_entry(key, item);
                }
                Ok(value)
            }
            Kind::Object => self.load_object(cx, entry, depth, replace),
        }
    }

    fn load_all(&self, cx: &Context, entries: &[Entry], depth: i32) -> Result<Vec<Value>> {
        entries
            .iter()
            .map(|entry| self.load_entry(cx, entry, depth))
            .collect()
    }

    fn load_object(&self, cx: &Context, entry: &Entry, depth: i32, replace: bool) -> Result<Value> {
        let oid = entry.oid;
        let fields = cx.storage.borrow().get_mapping(oid)?;

        let mut pieces: HashMap<String, Entry> = HashMap::new();
        for (key, piece) in fields {
            match self.load_entry(cx, &key, -1)? {
                Value::Str(name) => {
                    pieces.insert(name, piece);
                }
                other => {
                    return Err(Error::ReductionProtocol(format!(
                        "field name of {} must be a string, got {}",
                        oid,
                        other.type_name()
                    )));
                }
            }
        }

        // Constructor arguments are loaded with a small fixed bound
        let args = match pieces.get(FIELD_ARGS) {
            Some(piece) => match self.load_piece(cx, piece, 1)? {
                Value::Tuple(tuple) => tuple.items().to_vec(),
                other => {
                    return Err(Error::ReductionProtocol(format!(
                        "args of {} must be a tuple, got {}",
                        oid,
                        other.type_name()
                    )));
                }
            },
            None => Vec::new(),
        };

        let obj = cx.types.construct(&entry.otype, args)?;
        let value = Value::Object(obj.clone());
        self.register(cx, oid, &value, replace)?;

        let piece_depth = if depth < 0 { -1 } else { depth };
        self.apply_pieces(cx, &obj, &pieces, piece_depth)?;

        for name in pieces.keys() {
            if ![FIELD_ARGS, FIELD_STATE, FIELD_LIST_ITEMS, FIELD_DICT_ITEMS].contains(&name.as_str()) {
                tracing::warn!("Ignoring unknown reduction field '{}' on {}", name, oid);
            }
        }
        Ok(value)
    }

    fn apply_pieces(
        &self,
        cx: &Context,
        obj: &ObjectRef,
        pieces: &HashMap<String, Entry>,
        depth: i32,
    ) -> Result<()> {
        let target = obj.storable();

        if let Some(piece) = pieces.get(FIELD_STATE) {
            let state = self.load_piece(cx, piece, depth)?;
            target.apply_state(state)?;
        }
        if let Some(piece) = pieces.get(FIELD_LIST_ITEMS) {
            let items = self.load_piece(cx, piece, depth)?.items()?;
            target.apply_list_items(items)?;
        }
        if let Some(piece) = pieces.get(FIELD_DICT_ITEMS) {
            match self.load_piece(cx, piece, depth)? {
                Value::Dict(dict) => target.apply_dict_items(dict.entries())?,
                other => {
                    return Err(Error::ReductionProtocol(format!(
                        "dict items must be a mapping, got {}",
                        other.type_name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Rebuild a core scalar from its literal row
fn literal_value(otype: &str, literal: Literal) -> Result<Value> {
    match (otype, literal) {
        ("null", _) => Ok(Value::Null),
        ("bool", Literal::Integer(i)) => Ok(Value::Bool(i != 0)),
        ("int", Literal::Integer(i)) => Ok(Value::Int(i)),
        ("float", Literal::Real(f)) => Ok(Value::Float(f)),
        ("float", Literal::Integer(i)) => Ok(Value::Float(i as f64)),
        // SQLite stores NaN as NULL
        ("float", Literal::Null) => Ok(Value::Float(f64::NAN)),
        ("str", Literal::Text(s)) => Ok(Value::Str(s)),
        ("bytes", Literal::Blob(b)) => Ok(Value::Bytes(b)),
        (otype, literal) => Err(Error::TypeResolution(format!(
            "{} literal stored as {:?}",
            otype, literal
        ))),
    }
}

/// Resolver that maps urls through a fixed table
pub struct TableResolver {
    table: HashMap<String, Value>,
}

impl TableResolver {
    pub fn new(table: impl IntoIterator<Item = (String, Value)>) -> Arc<Self> {
        Arc::new(Self {
            table: table.into_iter().collect(),
        })
    }
}

impl ExternalResolver for TableResolver {
    fn resolve(&self, url: &str) -> Result<Option<Value>> {
        Ok(self.table.get(url).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityMaps;
    use crate::lazy::LazyHost;
    use crate::reduce::{FromReduction, Instance, Reduction, ToReduction, TypeRegistry};
    use crate::value::DictRef;
    use parking_lot::RwLock;
    use crate::serialize::Serializer;
    use crate::storage::SqliteStorage;
    use std::sync::Weak;

    struct NoHost;

    impl LazyHost for NoHost {
        fn load_lazy(&self, oid: Oid) -> Result<Value> {
            Err(Error::Detached(oid))
        }
    }

    fn context(types: TypeRegistry) -> Context {
        Context {
            storage: RefCell::new(Box::new(SqliteStorage::open_in_memory().unwrap())),
            identity: RefCell::new(IdentityMaps::new()),
            types,
            resolver: None,
            host: Weak::<NoHost>::new(),
            lazy_depth: 1,
        }
    }

    /// Keeps one dict as its whole state
    #[derive(Default)]
    struct Holder {
        state: RwLock<Option<DictRef>>,
    }

    impl ToReduction for Holder {
        fn otype(&self) -> String {
            "Holder".to_string()
        }

        fn reduce(&self) -> Result<Reduction> {
            let reduction = Reduction::new_instance("Holder");
            Ok(match self.state.read().clone() {
                Some(dict) => reduction.with_state(Value::Dict(dict)),
                None => reduction,
            })
        }
    }

    impl FromReduction for Holder {
        fn new_instance(_otype: &str, _args: Vec<Value>) -> Result<Self> {
            Ok(Holder::default())
        }

        fn apply_state(&self, state: Value) -> Result<()> {
            match state {
                Value::Dict(dict) => {
                    *self.state.write() = Some(dict);
                    Ok(())
                }
                other => Err(Error::ReductionProtocol(other.type_name())),
            }
        }
    }

    fn nested() -> Value {
        Value::list(vec![
            Value::list(vec![Value::from(1)]),
            Value::list(vec![Value::from(2)]),
        ])
    }

    #[test]
    fn test_child_depth() {
        assert_eq!(child_depth(-1), -1);
        assert_eq!(child_depth(0), 0);
        assert_eq!(child_depth(1), 0);
        assert_eq!(child_depth(3), 2);
    }

    #[test]
    fn test_literal_values() {
        assert_eq!(literal_value("bool", Literal::Integer(1)).unwrap(), Value::Bool(true));
        assert_eq!(literal_value("float", Literal::Integer(3)).unwrap(), Value::Float(3.0));
        assert!(literal_value("float", Literal::Null)
            .unwrap()
            .as_float()
            .unwrap()
            .is_nan());
        assert!(matches!(
            literal_value("int", Literal::Text("x".into())),
            Err(Error::TypeResolution(_))
        ));
    }

    #[test]
    fn test_depth_bounds_materialization() {
        let cx = context(TypeRegistry::default());
        let oid = Serializer::new().store(&cx, &nested(), None).unwrap();
        let de = Deserializer::new();

        cx.identity.borrow_mut().forget_all();
        let shallow = de.load(&cx, oid, 1).unwrap();
        let Value::Seq(seq) = &shallow else {
            panic!("expected a list");
        };
        assert!(seq.items().iter().all(Value::is_proxy));
        assert_eq!(de.deferred.borrow().len(), 2);

        drop(shallow);
        cx.identity.borrow_mut().forget_all();
        de.deferred.borrow_mut().clear();
        let deep = de.load(&cx, oid, 2).unwrap();
        assert!(deep.items().unwrap().iter().all(|v| !v.is_proxy()));
        assert!(deep.deep_eq(&nested()).unwrap());
    }

    #[test]
    fn test_depth_zero_returns_registered_proxy() {
        let cx = context(TypeRegistry::default());
        let oid = Serializer::new().store(&cx, &nested(), None).unwrap();
        cx.identity.borrow_mut().forget_all();

        let de = Deserializer::new();
        let first = de.load(&cx, oid, 0).unwrap();
        let second = de.load(&cx, oid, 0).unwrap();
        assert!(first.is_proxy());
        assert!(first.is_identical(&second));
        assert!(matches!(first.len(), Err(Error::Closed)));
    }

    #[test]
    fn test_object_round_trip_keeps_identity() {
        let types = TypeRegistry::builder().instance("Point").build();
        let cx = context(types);
        let point = Value::object(Instance::new("Point").with_attr("x", 1).with_attr("y", 2));
        let oid = Serializer::new().store(&cx, &point, None).unwrap();
        drop(point);
        cx.identity.borrow_mut().forget_all();

        let de = Deserializer::new();
        let loaded = de.load(&cx, oid, -1).unwrap();
        assert_eq!(loaded.get_attr("y").unwrap(), Some(Value::from(2)));
        assert!(de.load(&cx, oid, -1).unwrap().is_identical(&loaded));
        assert!(de.transitive.borrow().is_empty());
    }

    #[test]
    fn test_unknown_object_type_fails() {
        let types = TypeRegistry::builder().instance("Point").build();
        let mut cx = context(types);
        let oid = Serializer::new()
            .store(&cx, &Value::object(Instance::new("Point")), None)
            .unwrap();
        cx.identity.borrow_mut().forget_all();
        cx.types = TypeRegistry::default();

        let err = Deserializer::new().load(&cx, oid, 1).unwrap_err();
        assert!(matches!(err, Error::TypeResolution(ref t) if t == "Point"));
    }

    #[test]
    fn test_unresolved_external_keeps_url() {
        let cx = context(TypeRegistry::default());
        let oid = Serializer::new()
            .store(&cx, &Value::external("mod://thing"), None)
            .unwrap();
        cx.identity.borrow_mut().forget_all();

        let loaded = Deserializer::new().load(&cx, oid, 1).unwrap();
        assert!(matches!(&loaded, Value::External(e) if e.url() == "mod://thing"));
    }

    #[test]
    fn test_named_root_lookup() {
        let cx = context(TypeRegistry::default());
        Serializer::new().store(&cx, &Value::from("hello"), Some("greeting")).unwrap();
        let de = Deserializer::new();
        assert_eq!(de.load_named(&cx, "greeting", 1).unwrap(), Some(Value::from("hello")));
        assert!(de.load_named(&cx, "absent", 1).unwrap().is_none());
    }

    #[test]
    fn test_self_referential_state_piece() {
        let types = TypeRegistry::builder().register::<Holder>("Holder").build();
        let cx = context(types);
        let dict = DictRef::new();
        dict.insert(Value::from("me"), Value::Dict(dict.clone())).unwrap();
        let holder = Holder::default();
        *holder.state.write() = Some(dict.clone());
        let oid = Serializer::new().store(&cx, &Value::object(holder), None).unwrap();
        // Break the in-memory cycle so nothing is found by identity
        dict.insert(Value::from("me"), Value::Null).unwrap();
        cx.identity.borrow_mut().forget_all();

        let de = Deserializer::new();
        let loaded = de.load(&cx, oid, -1).unwrap();
        let Value::Object(obj) = &loaded else {
            panic!("expected an object");
        };
        let state = obj.downcast_ref::<Holder>().unwrap().state.read().clone().unwrap();
        let me = state.get(&Value::from("me")).unwrap().unwrap();
        assert!(me.is_identical(&Value::Dict(state.clone())));
        assert!(de.transitive.borrow().is_empty());
        assert!(de.pieces.borrow().is_empty());
    }
}
