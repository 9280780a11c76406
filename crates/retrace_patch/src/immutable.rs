//! Immutable type set.
//!
//! Values of immutable types cross the interception boundary as-is instead
//! of being proxied. Membership is closed under subclassing: a type that
//! derives from a member is a member, and the match is cached.

use crate::object::{Object, TypeRef};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

fn key(ty: &TypeRef) -> usize {
    Arc::as_ptr(ty).cast::<()>() as usize
}

/// Set of types treated as immutable
#[derive(Debug, Default)]
pub struct ImmutableTypeSet {
    roots: RwLock<Vec<TypeRef>>,
    cache: RwLock<HashMap<usize, TypeRef>>,
}

impl ImmutableTypeSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type; returns false if it was already a root
    pub fn add(&self, ty: TypeRef) -> bool {
        let mut roots = self.roots.write();
        if roots.iter().any(|r| Arc::ptr_eq(r, &ty)) {
            return false;
        }
        tracing::trace!(ty = ty.name(), "immutable type added");
        roots.push(ty);
        true
    }

    /// Remove a root type. Cached subclass matches are dropped with it.
    pub fn remove(&self, ty: &TypeRef) -> bool {
        let mut roots = self.roots.write();
        let before = roots.len();
        roots.retain(|r| !Arc::ptr_eq(r, ty));
        let removed = roots.len() != before;
        if removed {
            self.cache.write().clear();
        }
        removed
    }

    /// Whether `ty` is a member or derives from one
    #[must_use]
    pub fn contains(&self, ty: &TypeRef) -> bool {
        if self.cache.read().contains_key(&key(ty)) {
            return true;
        }
        let matched = self.roots.read().iter().any(|r| ty.is_subclass_of(r));
        if matched {
            self.cache.write().insert(key(ty), Arc::clone(ty));
        }
        matched
    }

    /// Whether `object` is an instance of a member type. Plain values are
    /// always immutable.
    #[must_use]
    pub fn is_immutable(&self, object: &Object) -> bool {
        match object {
            Object::Value(_) => true,
            Object::Instance(i) => self.contains(i.type_of()),
            Object::Type(_) | Object::Function(_) => false,
        }
    }

    /// Number of root types
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    /// Whether no root type was added
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached matches
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Instance, TypeDef};
    use retrace_core::Value;

    #[test]
    fn test_subclass_membership_is_cached() {
        let set = ImmutableTypeSet::new();
        let base = TypeDef::new("Decimal", vec![]).into_ref();
        let sub = TypeDef::new("Money", vec![Arc::clone(&base)]).into_ref();
        let other = TypeDef::new("Socket", vec![]).into_ref();

        assert!(set.add(Arc::clone(&base)));
        assert!(!set.add(Arc::clone(&base)));
        assert!(set.contains(&base));
        assert!(set.contains(&sub));
        assert!(!set.contains(&other));
        assert_eq!(set.cached(), 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_clears_cache() {
        let set = ImmutableTypeSet::new();
        let base = TypeDef::new("Decimal", vec![]).into_ref();
        let sub = TypeDef::new("Money", vec![Arc::clone(&base)]).into_ref();
        set.add(Arc::clone(&base));
        assert!(set.contains(&sub));

        assert!(set.remove(&base));
        assert!(!set.remove(&base));
        assert!(!set.contains(&sub));
        assert!(set.is_empty());
    }

    #[test]
    fn test_instances_and_values() {
        let set = ImmutableTypeSet::new();
        let ty = TypeDef::new("Point", vec![]).into_ref();
        let inst = Object::from(Instance::new(Arc::clone(&ty)));
        assert!(set.is_immutable(&Object::from(Value::Int(1))));
        assert!(!set.is_immutable(&inst));
        set.add(ty);
        assert!(set.is_immutable(&inst));
    }
}
