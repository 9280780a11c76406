//! Code units.

use crate::object::{Object, Scope};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A named, ordered table of objects; the unit the patch engine works on
pub struct Namespace {
    name: String,
    attrs: RwLock<IndexMap<String, Object>>,
}

impl Namespace {
    /// Create an empty namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: RwLock::new(IndexMap::new()),
        }
    }

    /// Add an entry
    #[must_use]
    pub fn with(self, name: impl Into<String>, value: impl Into<Object>) -> Self {
        self.attrs.write().insert(name.into(), value.into());
        self
    }

    /// Share the namespace
    #[must_use]
    pub fn into_ref(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Unit name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Object> {
        self.attrs.read().get(name).cloned()
    }

    /// Whether an entry exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.attrs.read().contains_key(name)
    }

    /// Replace or add an entry, returning the previous one
    pub fn set(&self, name: &str, value: Object) -> Option<Object> {
        self.attrs.write().insert(name.to_string(), value)
    }

    /// Snapshot of all entries in definition order
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Object)> {
        self.attrs
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn attrs(&self) -> &RwLock<IndexMap<String, Object>> {
        &self.attrs
    }
}

impl Scope for Namespace {
    fn scope_name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, name: &str) -> Option<Object> {
        self.get(name)
    }

    fn assign(&self, name: &str, value: Object) -> Option<Object> {
        self.set(name, value)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("entries", &self.attrs.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::Value;

    #[test]
    fn test_namespace_entries_ordered() {
        let ns = Namespace::new("app")
            .with("b", Value::Int(2))
            .with("a", Value::Int(1));
        let names: Vec<_> = ns.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_set_returns_previous() {
        let ns = Namespace::new("app").with("x", Value::Int(1));
        let prev = ns.set("x", Object::from(Value::Int(2)));
        assert!(matches!(prev, Some(Object::Value(Value::Int(1)))));
        assert!(ns.contains("x"));
        assert!(!ns.contains("y"));
    }
}
