//! Object model of code units.
//!
//! A code unit is a [`Namespace`] of named [`Object`]s. Functions, types and
//! instances are shared allocations whose identity is the allocation
//! address; plain values have no identity and compare by content.

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use retrace_core::{CallResult, Func, Raised, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

/// Hash function installed on a type or a hash slot. `None` means
/// unhashable.
pub type HashFn = Arc<dyn Fn(&Object) -> Option<u64> + Send + Sync>;

/// A named callable
pub struct Function {
    name: String,
    body: Func,
}

impl Function {
    /// Create a shared function
    pub fn new(name: impl Into<String>, body: Func) -> Arc<Self> {
        let function = Arc::new(Self {
            name: name.into(),
            body,
        });
        register(WeakObject::Function(Arc::downgrade(&function)));
        function
    }

    /// Function name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Callable body
    #[must_use]
    pub fn body(&self) -> &Func {
        &self.body
    }

    /// Invoke the function
    pub fn call(&self, args: &[Value]) -> CallResult {
        (self.body)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

/// A type: bases, an attribute table, and optional enum members
pub struct TypeDef {
    name: String,
    bases: Vec<TypeRef>,
    attrs: RwLock<IndexMap<String, Object>>,
    members: Vec<(String, Object)>,
    hash: RwLock<Option<HashFn>>,
}

/// Shared type handle
pub type TypeRef = Arc<TypeDef>;

impl TypeDef {
    /// Create a type deriving from `bases`
    pub fn new(name: impl Into<String>, bases: Vec<TypeRef>) -> Self {
        Self {
            name: name.into(),
            bases,
            attrs: RwLock::new(IndexMap::new()),
            members: Vec::new(),
            hash: RwLock::new(None),
        }
    }

    /// Add an attribute
    #[must_use]
    pub fn with_attr(self, name: impl Into<String>, value: Object) -> Self {
        self.attrs.write().insert(name.into(), value);
        self
    }

    /// Add an enum member
    #[must_use]
    pub fn with_member(mut self, name: impl Into<String>, value: Object) -> Self {
        self.members.push((name.into(), value));
        self
    }

    /// Share the type
    #[must_use]
    pub fn into_ref(self) -> TypeRef {
        let ty = Arc::new(self);
        register(WeakObject::Type(Arc::downgrade(&ty)));
        ty
    }

    /// Type name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct bases
    #[must_use]
    pub fn bases(&self) -> &[TypeRef] {
        &self.bases
    }

    /// Enum members, empty for ordinary types
    #[must_use]
    pub fn members(&self) -> &[(String, Object)] {
        &self.members
    }

    /// Whether this is an enumerated-constant type
    #[must_use]
    pub fn is_enum(&self) -> bool {
        !self.members.is_empty()
    }

    /// `self` is `other` or derives from it
    #[must_use]
    pub fn is_subclass_of(&self, other: &TypeDef) -> bool {
        std::ptr::eq(self, other) || self.bases.iter().any(|b| b.is_subclass_of(other))
    }

    /// Attribute by name
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<Object> {
        self.attrs.read().get(name).cloned()
    }

    /// Attribute names in definition order
    #[must_use]
    pub fn attr_names(&self) -> Vec<String> {
        self.attrs.read().keys().cloned().collect()
    }

    /// Replace an attribute, returning the previous one
    pub fn set_attr(&self, name: &str, value: Object) -> Option<Object> {
        self.attrs.write().insert(name.to_string(), value)
    }

    pub(crate) fn attrs(&self) -> &RwLock<IndexMap<String, Object>> {
        &self.attrs
    }

    /// Install or clear this type's own hash function, returning the
    /// previous one
    pub fn set_hash(&self, hash: Option<HashFn>) -> Option<HashFn> {
        std::mem::replace(&mut *self.hash.write(), hash)
    }

    /// This type's own hash function
    #[must_use]
    pub fn own_hash(&self) -> Option<HashFn> {
        self.hash.read().clone()
    }

    /// Nearest hash function along the base chain, depth first
    #[must_use]
    pub fn resolve_hash(&self) -> Option<HashFn> {
        self.own_hash()
            .or_else(|| self.bases.iter().find_map(|b| b.resolve_hash()))
    }
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<type {}>", self.name)
    }
}

/// An instance of a type
pub struct Instance {
    ty: TypeRef,
    fields: Mutex<BTreeMap<String, Value>>,
}

impl Instance {
    /// Create an instance of `ty`
    pub fn new(ty: TypeRef) -> Arc<Self> {
        let instance = Arc::new(Self {
            ty,
            fields: Mutex::new(BTreeMap::new()),
        });
        register(WeakObject::Instance(Arc::downgrade(&instance)));
        instance
    }

    /// Type of the instance
    #[must_use]
    pub fn type_of(&self) -> &TypeRef {
        &self.ty
    }

    /// Field by name
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.lock().get(name).cloned()
    }

    /// Set a field
    pub fn set_field(&self, name: impl Into<String>, value: Value) {
        self.fields.lock().insert(name.into(), value);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} instance>", self.ty.name())
    }
}

/// Anything a namespace can hold
#[derive(Clone)]
pub enum Object {
    /// Callable
    Function(Arc<Function>),
    /// Type
    Type(TypeRef),
    /// Instance of a type
    Instance(Arc<Instance>),
    /// Plain value without identity
    Value(Value),
}

impl Object {
    /// Identity of shared objects; `None` for plain values
    #[must_use]
    pub fn identity(&self) -> Option<usize> {
        match self {
            Self::Function(f) => Some(Arc::as_ptr(f).cast::<()>() as usize),
            Self::Type(t) => Some(Arc::as_ptr(t).cast::<()>() as usize),
            Self::Instance(i) => Some(Arc::as_ptr(i).cast::<()>() as usize),
            Self::Value(_) => None,
        }
    }

    /// Same object: identical allocation, or equal plain values
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            _ => self.identity().is_some() && self.identity() == other.identity(),
        }
    }

    /// Kind name for messages
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Type(_) => "type",
            Self::Instance(_) => "instance",
            Self::Value(_) => "value",
        }
    }

    /// Function, if this is one
    #[must_use]
    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Type, if this is one
    #[must_use]
    pub fn as_type(&self) -> Option<&TypeRef> {
        match self {
            Self::Type(t) => Some(t),
            _ => None,
        }
    }

    /// Call a function object
    ///
    /// # Errors
    ///
    /// Raises `TypeError` if the object is not callable
    pub fn call(&self, args: &[Value]) -> CallResult {
        match self {
            Self::Function(f) => f.call(args),
            other => Err(Raised::new(
                "TypeError",
                format!("{} object is not callable", other.kind_name()),
            )
            .into()),
        }
    }

    /// Hash through the installed hash functions, falling back to identity.
    /// Instances use their type's hash first, then the object slot; types
    /// use the object slot; functions use the callable slot. `None` means
    /// unhashable.
    #[must_use]
    pub fn hash_with(&self, slots: &HashSlots) -> Option<u64> {
        let installed = match self {
            Self::Value(v) => return Some(value_hash(v)),
            Self::Instance(i) => i.ty.resolve_hash().or_else(|| slots.object()),
            Self::Type(_) => slots.object(),
            Self::Function(_) => slots.callable(),
        };
        match installed {
            Some(hash) => hash(self),
            None => self.identity().map(|id| id as u64),
        }
    }
}

fn value_hash(value: &Value) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(func) => func.fmt(f),
            Self::Type(t) => t.fmt(f),
            Self::Instance(i) => i.fmt(f),
            Self::Value(v) => write!(f, "{}", v),
        }
    }
}

impl From<Arc<Function>> for Object {
    fn from(f: Arc<Function>) -> Self {
        Self::Function(f)
    }
}

impl From<TypeRef> for Object {
    fn from(t: TypeRef) -> Self {
        Self::Type(t)
    }
}

impl From<Arc<Instance>> for Object {
    fn from(i: Arc<Instance>) -> Self {
        Self::Instance(i)
    }
}

impl From<Value> for Object {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

/// Non-owning handle to a shared object
#[derive(Debug, Clone)]
pub enum WeakObject {
    /// Callable
    Function(Weak<Function>),
    /// Type
    Type(Weak<TypeDef>),
    /// Instance of a type
    Instance(Weak<Instance>),
}

impl WeakObject {
    /// Weak handle to `object`; `None` for plain values
    #[must_use]
    pub fn of(object: &Object) -> Option<Self> {
        match object {
            Object::Function(f) => Some(Self::Function(Arc::downgrade(f))),
            Object::Type(t) => Some(Self::Type(Arc::downgrade(t))),
            Object::Instance(i) => Some(Self::Instance(Arc::downgrade(i))),
            Object::Value(_) => None,
        }
    }

    /// The object, if still alive
    #[must_use]
    pub fn upgrade(&self) -> Option<Object> {
        match self {
            Self::Function(w) => w.upgrade().map(Object::Function),
            Self::Type(w) => w.upgrade().map(Object::Type),
            Self::Instance(w) => w.upgrade().map(Object::Instance),
        }
    }

    /// Whether the object is still alive
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Function(w) => w.strong_count() > 0,
            Self::Type(w) => w.strong_count() > 0,
            Self::Instance(w) => w.strong_count() > 0,
        }
    }
}

const MIN_PRUNE: usize = 64;

struct LiveObjects {
    entries: Vec<WeakObject>,
    prune_at: usize,
}

static LIVE: Mutex<LiveObjects> = Mutex::new(LiveObjects {
    entries: Vec::new(),
    prune_at: MIN_PRUNE,
});

fn register(object: WeakObject) {
    let mut live = LIVE.lock();
    if live.entries.len() >= live.prune_at {
        live.entries.retain(WeakObject::is_alive);
        live.prune_at = (live.entries.len() * 2).max(MIN_PRUNE);
    }
    live.entries.push(object);
}

/// Every function, type and instance still alive, in creation order
#[must_use]
pub fn live_objects() -> Vec<Object> {
    LIVE.lock().entries.iter().filter_map(WeakObject::upgrade).collect()
}

/// Identity-keyed handle to a shared object
#[derive(Debug, Clone)]
pub struct ObjectKey {
    id: usize,
    object: Object,
}

impl ObjectKey {
    /// Key for `object`; `None` for plain values
    #[must_use]
    pub fn of(object: &Object) -> Option<Self> {
        object.identity().map(|id| Self {
            id,
            object: object.clone(),
        })
    }

    /// The keyed object
    #[must_use]
    pub fn object(&self) -> &Object {
        &self.object
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Process-wide hash slots for the broadest supertypes
#[derive(Default)]
pub struct HashSlots {
    object: RwLock<Option<HashFn>>,
    callable: RwLock<Option<HashFn>>,
}

impl HashSlots {
    /// Create empty slots
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash function for types and instances without their own
    #[must_use]
    pub fn object(&self) -> Option<HashFn> {
        self.object.read().clone()
    }

    /// Hash function for functions
    #[must_use]
    pub fn callable(&self) -> Option<HashFn> {
        self.callable.read().clone()
    }

    /// Install the object slot, returning the previous function
    pub fn set_object(&self, hash: Option<HashFn>) -> Option<HashFn> {
        std::mem::replace(&mut *self.object.write(), hash)
    }

    /// Install the callable slot, returning the previous function
    pub fn set_callable(&self, hash: Option<HashFn>) -> Option<HashFn> {
        std::mem::replace(&mut *self.callable.write(), hash)
    }
}

impl fmt::Debug for HashSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashSlots")
            .field("object", &self.object.read().is_some())
            .field("callable", &self.callable.read().is_some())
            .finish()
    }
}

/// A named attribute table the patch engine can rewrite
pub trait Scope: Send + Sync {
    /// Name used in qualified names and messages
    fn scope_name(&self) -> &str;

    /// Attribute by name
    fn lookup(&self, name: &str) -> Option<Object>;

    /// Replace an attribute, returning the previous one
    fn assign(&self, name: &str, value: Object) -> Option<Object>;
}

impl Scope for TypeDef {
    fn scope_name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, name: &str) -> Option<Object> {
        self.attr(name)
    }

    fn assign(&self, name: &str, value: Object) -> Option<Object> {
        self.set_attr(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::func;

    fn noop(name: &str) -> Arc<Function> {
        Function::new(name, func(|_| Ok(Value::Unit)))
    }

    #[test]
    fn test_subclass() {
        let base = TypeDef::new("Base", vec![]).into_ref();
        let mid = TypeDef::new("Mid", vec![Arc::clone(&base)]).into_ref();
        let leaf = TypeDef::new("Leaf", vec![Arc::clone(&mid)]).into_ref();
        let other = TypeDef::new("Other", vec![]).into_ref();

        assert!(leaf.is_subclass_of(&base));
        assert!(leaf.is_subclass_of(&leaf));
        assert!(!base.is_subclass_of(&leaf));
        assert!(!other.is_subclass_of(&base));
    }

    #[test]
    fn test_identity() {
        let f = Object::from(noop("f"));
        let g = Object::from(noop("f"));
        assert!(f.same(&f.clone()));
        assert!(!f.same(&g));
        assert!(Object::from(Value::Int(1)).same(&Object::from(Value::Int(1))));
        assert_eq!(Object::from(Value::Unit).identity(), None);
    }

    #[test]
    fn test_call_non_callable() {
        let err = Object::from(Value::Int(3)).call(&[]).unwrap_err();
        assert_eq!(err.as_raised().map(|r| r.kind.as_str()), Some("TypeError"));
    }

    #[test]
    fn test_hash_resolution() {
        let slots = HashSlots::new();
        let base = TypeDef::new("Base", vec![]).into_ref();
        let leaf = TypeDef::new("Leaf", vec![Arc::clone(&base)]).into_ref();
        let inst = Object::from(Instance::new(Arc::clone(&leaf)));

        assert_eq!(inst.hash_with(&slots), inst.identity().map(|i| i as u64));

        slots.set_object(Some(Arc::new(|_: &Object| Some(1))));
        assert_eq!(inst.hash_with(&slots), Some(1));

        base.set_hash(Some(Arc::new(|_: &Object| Some(2))));
        assert_eq!(inst.hash_with(&slots), Some(2));

        base.set_hash(Some(Arc::new(|_: &Object| None)));
        assert_eq!(inst.hash_with(&slots), None);
    }

    #[test]
    fn test_object_key() {
        let f = Object::from(noop("f"));
        assert_eq!(ObjectKey::of(&f), ObjectKey::of(&f.clone()));
        assert!(ObjectKey::of(&Object::from(Value::Unit)).is_none());
    }

    #[test]
    fn test_type_attrs() {
        let ty = TypeDef::new("Clock", vec![])
            .with_attr("now", Object::from(noop("now")))
            .into_ref();
        assert_eq!(ty.attr_names(), vec!["now".to_string()]);
        let prev = ty.set_attr("now", Object::from(Value::Int(0)));
        assert!(prev.is_some());
        assert!(matches!(ty.lookup("now"), Some(Object::Value(Value::Int(0)))));
    }

    #[test]
    fn test_live_objects_in_creation_order() {
        let ty = TypeDef::new("Socket", vec![]).into_ref();
        let first = Object::from(Instance::new(Arc::clone(&ty)));
        let second = Object::from(noop("close"));
        let position = |target: &Object| live_objects().iter().position(|o| o.same(target));

        let (ty_at, first_at, second_at) = (
            position(&Object::from(Arc::clone(&ty))).unwrap(),
            position(&first).unwrap(),
            position(&second).unwrap(),
        );
        assert!(ty_at < first_at && first_at < second_at);

        let gone = WeakObject::of(&second).unwrap();
        drop(second);
        assert!(!gone.is_alive());
        assert!(gone.upgrade().is_none());
        assert!(WeakObject::of(&Object::from(Value::Unit)).is_none());
    }
}
