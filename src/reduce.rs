//! Reduction protocol for user objects
//!
//! A user object is stored as a [`Reduction`]: a constructor reference,
//! constructor arguments, and up to three optional pieces (state, list
//! items, dict items). Loading reverses it: the constructor is looked up
//! by otype in a [`TypeRegistry`], called with the arguments, and the
//! pieces are applied to the fresh instance.
//!
//! Types opt in by implementing [`ToReduction`] and [`FromReduction`];
//! anything implementing both is [`Storable`]. [`Instance`] is a generic
//! attribute bag usable for any otype without writing a new type.

use crate::value::Value;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

/// Upcast helper so trait objects can be downcast to their concrete type
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// How an object is re-created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constructor {
    /// Allocate a fresh instance of the named otype
    NewInstance(String),
    /// Call an arbitrary named function; not storable
    Named(String),
}

/// Decomposition of an object into storable pieces.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub constructor: Constructor,
    pub args: Vec<Value>,
    pub state: Option<Value>,
    pub list_items: Option<Vec<Value>>,
    pub dict_items: Option<Vec<(Value, Value)>>,
}

impl Reduction {
    pub fn new_instance(otype: impl Into<String>) -> Self {
        Self {
            constructor: Constructor::NewInstance(otype.into()),
            args: Vec::new(),
            state: None,
            list_items: None,
            dict_items: None,
        }
    }

    pub fn named(function: impl Into<String>) -> Self {
        Self {
            constructor: Constructor::Named(function.into()),
            ..Self::new_instance("")
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_list_items(mut self, items: Vec<Value>) -> Self {
        self.list_items = Some(items);
        self
    }

    pub fn with_dict_items(mut self, items: Vec<(Value, Value)>) -> Self {
        self.dict_items = Some(items);
        self
    }
}

/// Produce a reduction for storing
pub trait ToReduction {
    /// Type name recorded with the stored entity
    fn otype(&self) -> String;

    fn reduce(&self) -> Result<Reduction>;
}

/// Rebuild an object from a reduction
pub trait FromReduction {
    fn new_instance(otype: &str, args: Vec<Value>) -> Result<Self>
    where
        Self: Sized;

    /// Attribute storage used by the default state handling
    fn attribute_store(&self) -> Option<&RwLock<BTreeMap<String, Value>>> {
        None
    }

    /// Merge a string-keyed state mapping into the attribute store
    fn apply_state(&self, state: Value) -> Result<()> {
        let Some(store) = self.attribute_store() else {
            return Err(Error::ReductionProtocol(
                "object accepts no state".to_string(),
            ));
        };
        let Value::Dict(dict) = state.resolve()? else {
            return Err(Error::ReductionProtocol(
                "state must be a mapping".to_string(),
            ));
        };
        let mut attrs = store.write();
        for (key, value) in dict.entries() {
            match key.resolve()? {
                Value::Str(name) => {
                    attrs.insert(name, value);
                }
                other => {
                    return Err(Error::ReductionProtocol(format!(
                        "state key must be a string, got {}",
                        other.type_name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply_list_items(&self, _items: Vec<Value>) -> Result<()> {
        Err(Error::ReductionProtocol(
            "object accepts no list items".to_string(),
        ))
    }

    fn apply_dict_items(&self, _items: Vec<(Value, Value)>) -> Result<()> {
        Err(Error::ReductionProtocol(
            "object accepts no dict items".to_string(),
        ))
    }
}

/// A user object that can be stored and loaded.
pub trait Storable: ToReduction + FromReduction + AsAny {}

impl<T: ToReduction + FromReduction + Any + Send + Sync> Storable for T {}

/// Shared handle to a user object.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Storable>);

impl ObjectRef {
    pub fn new<T: Storable>(obj: T) -> Self {
        Self(Arc::new(obj))
    }

    pub fn from_arc(obj: Arc<dyn Storable>) -> Self {
        Self(obj)
    }

    pub fn otype(&self) -> String {
        self.0.otype()
    }

    pub fn reduce(&self) -> Result<Reduction> {
        self.0.reduce()
    }

    pub fn storable(&self) -> &dyn Storable {
        self.0.as_ref()
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downgrade(&self) -> Weak<dyn Storable> {
        Arc::downgrade(&self.0)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.addr() == other.addr()
    }

    pub fn downcast_ref<T: Storable>(&self) -> Option<&T> {
        AsAny::as_any(&*self.0).downcast_ref::<T>()
    }

    pub fn downcast<T: Storable>(&self) -> Option<Arc<T>> {
        AsAny::into_any(self.0.clone()).downcast::<T>().ok()
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.0
            .attribute_store()
            .and_then(|attrs| attrs.read().get(name).cloned())
    }

    pub fn list_items(&self) -> Vec<Value> {
        self.reduce()
            .ok()
            .and_then(|r| r.list_items)
            .unwrap_or_default()
    }

    pub fn dict_items(&self) -> Vec<(Value, Value)> {
        self.reduce()
            .ok()
            .and_then(|r| r.dict_items)
            .unwrap_or_default()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({} at {:#x})", self.otype(), self.addr())
    }
}

// ========== Generic instance ==========

/// Attribute bag with optional list-like and dict-like contents.
///
/// Reduces to a fresh-instance constructor with no arguments; attributes
/// become the state piece, `items` the list items and `entries` the dict
/// items. Empty pieces are omitted.
pub struct Instance {
    otype: String,
    attrs: RwLock<BTreeMap<String, Value>>,
    items: RwLock<Option<Vec<Value>>>,
    entries: RwLock<Option<Vec<(Value, Value)>>>,
}

impl Instance {
    pub fn new(otype: impl Into<String>) -> Self {
        Self {
            otype: otype.into(),
            attrs: RwLock::new(BTreeMap::new()),
            items: RwLock::new(None),
            entries: RwLock::new(None),
        }
    }

    /// A list subclass instance
    pub fn with_items(self, items: Vec<Value>) -> Self {
        *self.items.write() = Some(items);
        self
    }

    /// A dict subclass instance
    pub fn with_entries(self, entries: Vec<(Value, Value)>) -> Self {
        *self.entries.write() = Some(entries);
        self
    }

    pub fn with_attr(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.write().insert(name.into(), value.into());
        self
    }

    pub fn set_attr(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.attrs.write().insert(name.into(), value.into());
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs.read().get(name).cloned()
    }

    pub fn items(&self) -> Vec<Value> {
        self.items.read().clone().unwrap_or_default()
    }

    pub fn push_item(&self, value: impl Into<Value>) {
        self.items
            .write()
            .get_or_insert_with(Vec::new)
            .push(value.into());
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.entries.read().clone().unwrap_or_default()
    }
}

impl ToReduction for Instance {
    fn otype(&self) -> String {
        self.otype.clone()
    }

    fn reduce(&self) -> Result<Reduction> {
        let mut reduction = Reduction::new_instance(self.otype.clone());
        let attrs = self.attrs.read();
        if !attrs.is_empty() {
            let state = Value::dict(
                attrs
                    .iter()
                    .map(|(name, value)| (Value::Str(name.clone()), value.clone())),
            )?;
            reduction = reduction.with_state(state);
        }
        if let Some(items) = self.items.read().as_ref() {
            if !items.is_empty() {
                reduction = reduction.with_list_items(items.clone());
            }
        }
        if let Some(entries) = self.entries.read().as_ref() {
            if !entries.is_empty() {
                reduction = reduction.with_dict_items(entries.clone());
            }
        }
        Ok(reduction)
    }
}

impl FromReduction for Instance {
    fn new_instance(otype: &str, args: Vec<Value>) -> Result<Self> {
        if !args.is_empty() {
            return Err(Error::ReductionProtocol(format!(
                "{} takes no constructor arguments, got {}",
                otype,
                args.len()
            )));
        }
        Ok(Instance::new(otype))
    }

    fn attribute_store(&self) -> Option<&RwLock<BTreeMap<String, Value>>> {
        Some(&self.attrs)
    }

    fn apply_list_items(&self, items: Vec<Value>) -> Result<()> {
        self.items
            .write()
            .get_or_insert_with(Vec::new)
            .extend(items);
        Ok(())
    }

    fn apply_dict_items(&self, items: Vec<(Value, Value)>) -> Result<()> {
        self.entries
            .write()
            .get_or_insert_with(Vec::new)
            .extend(items);
        Ok(())
    }
}

// ========== Type registry ==========

type Factory = Arc<dyn Fn(&str, Vec<Value>) -> Result<ObjectRef> + Send + Sync>;

/// Otype-to-constructor table consulted when loading objects.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    factories: Arc<HashMap<String, Factory>>,
    instance_fallback: bool,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Whether objects of this otype can be stored and loaded
    pub fn contains(&self, otype: &str) -> bool {
        self.instance_fallback || self.factories.contains_key(otype)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Create a fresh instance of `otype`
    pub fn construct(&self, otype: &str, args: Vec<Value>) -> Result<ObjectRef> {
        match self.factories.get(otype) {
            Some(factory) => factory(otype, args),
            None if self.instance_fallback => {
                Ok(ObjectRef::new(Instance::new_instance(otype, args)?))
            }
            None => Err(Error::TypeResolution(otype.to_string())),
        }
    }
}

#[derive(Default)]
pub struct TypeRegistryBuilder {
    factories: HashMap<String, Factory>,
    instance_fallback: bool,
}

impl TypeRegistryBuilder {
    /// Register a concrete type under `otype`
    pub fn register<T: Storable>(mut self, otype: impl Into<String>) -> Self {
        let factory: Factory =
            Arc::new(|otype: &str, args: Vec<Value>| Ok(ObjectRef::new(T::new_instance(otype, args)?)));
        self.factories.insert(otype.into(), factory);
        self
    }

    /// Register `otype` as a generic [`Instance`]
    pub fn instance(self, otype: impl Into<String>) -> Self {
        self.register::<Instance>(otype)
    }

    /// Treat every unregistered otype as a generic [`Instance`]
    pub fn instance_fallback(mut self, enabled: bool) -> Self {
        self.instance_fallback = enabled;
        self
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            factories: Arc::new(self.factories),
            instance_fallback: self.instance_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Celsius {
        degrees: f64,
    }

    impl ToReduction for Celsius {
        fn otype(&self) -> String {
            "Celsius".to_string()
        }

        fn reduce(&self) -> Result<Reduction> {
            Ok(Reduction::new_instance("Celsius").with_args(vec![self.degrees.into()]))
        }
    }

    impl FromReduction for Celsius {
        fn new_instance(_otype: &str, args: Vec<Value>) -> Result<Self> {
            match args.first().and_then(Value::as_float) {
                Some(degrees) => Ok(Celsius { degrees }),
                None => Err(Error::ReductionProtocol("expected degrees".to_string())),
            }
        }
    }

    #[test]
    fn test_instance_reduction_omits_empty_pieces() {
        let point = Instance::new("Point").with_attr("x", 1).with_attr("y", 2);
        let reduction = point.reduce().unwrap();
        assert_eq!(reduction.constructor, Constructor::NewInstance("Point".to_string()));
        assert!(reduction.args.is_empty());
        assert!(reduction.state.is_some());
        assert!(reduction.list_items.is_none());
        assert!(reduction.dict_items.is_none());
    }

    #[test]
    fn test_apply_state_merges_attributes() {
        let point = Instance::new("Point").with_attr("x", 1);
        let state = Value::dict([(Value::from("y"), Value::from(2))]).unwrap();
        point.apply_state(state).unwrap();
        assert_eq!(point.get_attr("x"), Some(Value::from(1)));
        assert_eq!(point.get_attr("y"), Some(Value::from(2)));
    }

    #[test]
    fn test_apply_state_rejects_non_mapping() {
        let point = Instance::new("Point");
        let err = point.apply_state(Value::list(vec![])).unwrap_err();
        assert!(matches!(err, Error::ReductionProtocol(_)));
    }

    #[test]
    fn test_registry_constructs_registered_types() {
        let types = TypeRegistry::builder()
            .register::<Celsius>("Celsius")
            .instance("Point")
            .build();
        assert!(types.contains("Celsius"));
        assert!(!types.contains("Missing"));

        let obj = types.construct("Celsius", vec![21.5.into()]).unwrap();
        assert_eq!(obj.downcast_ref::<Celsius>().map(|c| c.degrees), Some(21.5));
        assert!(obj.downcast::<Celsius>().is_some());

        let err = types.construct("Missing", vec![]).unwrap_err();
        assert!(matches!(err, Error::TypeResolution(name) if name == "Missing"));
    }

    #[test]
    fn test_instance_fallback() {
        let types = TypeRegistry::builder().instance_fallback(true).build();
        let obj = types.construct("Anything", vec![]).unwrap();
        assert_eq!(obj.otype(), "Anything");
    }

    #[test]
    fn test_object_attribute_access() {
        let value = Value::object(Instance::new("Point").with_attr("x", 7));
        assert_eq!(value.get_attr("x").unwrap(), Some(Value::from(7)));
        assert_eq!(value.get_attr("z").unwrap(), None);
    }
}
