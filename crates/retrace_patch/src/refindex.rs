//! Backreference index.
//!
//! Containers that may hold references to patchable objects register here.
//! When an object is replaced after other code already captured it, every
//! registered container is asked to rewrite its entries: mapping values,
//! mapping keys, sequence elements and set members.

use crate::namespace::Namespace;
use crate::object::{Object, ObjectKey, TypeDef};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A container whose references can be rewritten
pub trait Container: Send + Sync {
    /// Replace every reference to `old` with `new`; returns how many
    /// entries changed
    fn replace_refs(&self, old: &Object, new: &Object) -> usize;
}

fn replace_values<'a>(values: impl Iterator<Item = &'a mut Object>, old: &Object, new: &Object) -> usize {
    let mut changed = 0;
    for value in values {
        if value.same(old) {
            *value = new.clone();
            changed += 1;
        }
    }
    changed
}

impl Container for Namespace {
    fn replace_refs(&self, old: &Object, new: &Object) -> usize {
        replace_values(self.attrs().write().values_mut(), old, new)
    }
}

impl Container for TypeDef {
    fn replace_refs(&self, old: &Object, new: &Object) -> usize {
        replace_values(self.attrs().write().values_mut(), old, new)
    }
}

/// Sequence of objects
#[derive(Debug, Default)]
pub struct ObjectList(Mutex<Vec<Object>>);

impl ObjectList {
    /// Create from items
    #[must_use]
    pub fn new(items: Vec<Object>) -> Self {
        Self(Mutex::new(items))
    }

    /// Snapshot of the items
    #[must_use]
    pub fn items(&self) -> Vec<Object> {
        self.0.lock().clone()
    }

    /// Append an item
    pub fn push(&self, item: Object) {
        self.0.lock().push(item);
    }
}

impl Container for ObjectList {
    fn replace_refs(&self, old: &Object, new: &Object) -> usize {
        replace_values(self.0.lock().iter_mut(), old, new)
    }
}

/// Set of objects, unique by identity (or value for plain values)
#[derive(Debug, Default)]
pub struct ObjectSet(Mutex<Vec<Object>>);

impl ObjectSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert; returns false if already present
    pub fn insert(&self, item: Object) -> bool {
        let mut items = self.0.lock();
        if items.iter().any(|i| i.same(&item)) {
            return false;
        }
        items.push(item);
        true
    }

    /// Membership
    #[must_use]
    pub fn contains(&self, item: &Object) -> bool {
        self.0.lock().iter().any(|i| i.same(item))
    }

    /// Number of members
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Container for ObjectSet {
    fn replace_refs(&self, old: &Object, new: &Object) -> usize {
        let mut items = self.0.lock();
        let Some(pos) = items.iter().position(|i| i.same(old)) else {
            return 0;
        };
        items.remove(pos);
        if !items.iter().any(|i| i.same(new)) {
            items.push(new.clone());
        }
        1
    }
}

/// Mapping key: a name or an object identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    /// String key
    Name(String),
    /// Object key
    Object(ObjectKey),
}

/// Mapping from names or objects to objects
#[derive(Debug, Default)]
pub struct ObjectMap(Mutex<IndexMap<MapKey, Object>>);

impl ObjectMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning the previous value
    pub fn insert(&self, key: MapKey, value: Object) -> Option<Object> {
        self.0.lock().insert(key, value)
    }

    /// Value by key
    #[must_use]
    pub fn get(&self, key: &MapKey) -> Option<Object> {
        self.0.lock().get(key).cloned()
    }

    /// Snapshot of the keys
    #[must_use]
    pub fn keys(&self) -> Vec<MapKey> {
        self.0.lock().keys().cloned().collect()
    }
}

impl Container for ObjectMap {
    fn replace_refs(&self, old: &Object, new: &Object) -> usize {
        let mut map = self.0.lock();
        let mut changed = replace_values(map.values_mut(), old, new);

        // A key already naming `new` wins over the rewritten one, as in
        // `ObjectSet`.
        if let (Some(old_key), Some(new_key)) = (ObjectKey::of(old), ObjectKey::of(new)) {
            let old_key = MapKey::Object(old_key);
            let new_key = MapKey::Object(new_key);
            if let Some(index) = map.get_index_of(&old_key) {
                if let Some((_, value)) = map.shift_remove_index(index) {
                    if !map.contains_key(&new_key) {
                        let (last, _) = map.insert_full(new_key, value);
                        let len = map.len();
                        map.move_index(last, index.min(len - 1));
                    }
                    changed += 1;
                }
            }
        }
        changed
    }
}

/// Registry of containers to rewrite on replacement
#[derive(Default)]
pub struct ReferenceIndex {
    containers: Mutex<Vec<Weak<dyn Container>>>,
}

impl ReferenceIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a container for as long as it lives
    pub fn register(&self, container: &Arc<dyn Container>) {
        self.containers.lock().push(Arc::downgrade(container));
    }

    /// Number of live containers
    #[must_use]
    pub fn len(&self) -> usize {
        self.containers
            .lock()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Whether no live containers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite every reference to `old` in every live container; returns
    /// the number of entries changed
    pub fn replace_all(&self, old: &Object, new: &Object) -> usize {
        if old.identity().is_none() || old.same(new) {
            return 0;
        }
        let live: Vec<Arc<dyn Container>> = {
            let mut containers = self.containers.lock();
            containers.retain(|c| c.strong_count() > 0);
            containers.iter().filter_map(Weak::upgrade).collect()
        };
        let changed: usize = live.iter().map(|c| c.replace_refs(old, new)).sum();
        tracing::trace!(changed, "references rewritten");
        changed
    }
}

impl std::fmt::Debug for ReferenceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceIndex")
            .field("containers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Function;
    use retrace_core::{Value, func};

    fn function(name: &str) -> Object {
        Object::from(Function::new(name, func(|_| Ok(Value::Unit))))
    }

    #[test]
    fn test_rewrites_every_container_kind() {
        let old = function("old");
        let new = function("new");
        let index = ReferenceIndex::new();

        let list = Arc::new(ObjectList::new(vec![old.clone(), Object::from(Value::Int(1)), old.clone()]));
        let set = Arc::new(ObjectSet::new());
        set.insert(old.clone());
        let map = Arc::new(ObjectMap::new());
        map.insert(MapKey::Name("handler".to_string()), old.clone());
        map.insert(MapKey::Object(ObjectKey::of(&old).unwrap()), Object::from(Value::from("meta")));
        let ns = Arc::new(Namespace::new("other").with("alias", old.clone()));

        for c in [
            Arc::clone(&list) as Arc<dyn Container>,
            Arc::clone(&set) as Arc<dyn Container>,
            Arc::clone(&map) as Arc<dyn Container>,
            Arc::clone(&ns) as Arc<dyn Container>,
        ] {
            index.register(&c);
        }

        let changed = index.replace_all(&old, &new);
        assert_eq!(changed, 2 + 1 + 2 + 1);

        assert!(list.items()[0].same(&new));
        assert!(list.items()[2].same(&new));
        assert!(set.contains(&new) && !set.contains(&old));
        assert!(map.get(&MapKey::Name("handler".to_string())).unwrap().same(&new));
        assert!(map.get(&MapKey::Object(ObjectKey::of(&new).unwrap())).is_some());
        assert!(map.get(&MapKey::Object(ObjectKey::of(&old).unwrap())).is_none());
        assert!(ns.get("alias").unwrap().same(&new));
    }

    #[test]
    fn test_map_key_keeps_position() {
        let old = function("old");
        let new = function("new");
        let map = ObjectMap::new();
        map.insert(MapKey::Name("a".to_string()), Object::from(Value::Int(1)));
        map.insert(MapKey::Object(ObjectKey::of(&old).unwrap()), Object::from(Value::Int(2)));
        map.insert(MapKey::Name("c".to_string()), Object::from(Value::Int(3)));

        map.replace_refs(&old, &new);
        let keys = map.keys();
        assert_eq!(keys[1], MapKey::Object(ObjectKey::of(&new).unwrap()));
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_map_key_collision_keeps_existing_entry() {
        let old = function("old");
        let new = function("new");
        let map = ObjectMap::new();
        map.insert(MapKey::Object(ObjectKey::of(&new).unwrap()), Object::from(Value::from("current")));
        map.insert(MapKey::Object(ObjectKey::of(&old).unwrap()), Object::from(Value::from("stale")));
        map.insert(MapKey::Name("c".to_string()), Object::from(Value::Int(3)));

        assert_eq!(map.replace_refs(&old, &new), 1);
        let keys = map.keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], MapKey::Object(ObjectKey::of(&new).unwrap()));
        assert!(matches!(
            map.get(&keys[0]),
            Some(Object::Value(Value::Str(s))) if s == "current"
        ));
        assert!(map.get(&MapKey::Object(ObjectKey::of(&old).unwrap())).is_none());
    }

    #[test]
    fn test_dead_containers_are_dropped() {
        let index = ReferenceIndex::new();
        {
            let list: Arc<dyn Container> = Arc::new(ObjectList::default());
            index.register(&list);
            assert_eq!(index.len(), 1);
        }
        assert!(index.is_empty());
    }

    #[test]
    fn test_values_are_not_rewritten() {
        let index = ReferenceIndex::new();
        let list: Arc<dyn Container> = Arc::new(ObjectList::new(vec![Object::from(Value::Int(1))]));
        index.register(&list);
        assert_eq!(
            index.replace_all(&Object::from(Value::Int(1)), &Object::from(Value::Int(2))),
            0
        );
    }
}
