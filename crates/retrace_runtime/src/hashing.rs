//! Deterministic hashing.
//!
//! Default object hashes derive from allocation addresses, which differ
//! from run to run. The [`DeterministicHasher`] hands out hashes from
//! counters instead: one counter per thread and dispatch state, so the
//! sequence a thread observes is the same on record and replay. A hash is
//! assigned the first time an object is hashed and cached while the object
//! is alive.
//!
//! Counters live in thread-local storage. Every record or replay run starts
//! from a [reset](DeterministicHasher::reset) that pre-seeds whatever is
//! alive at that point, so objects older than the run hash the same way on
//! both sides.

use parking_lot::RwLock;
use retrace_core::{DispatchState, ThreadKey, ThreadState};
use retrace_patch::{HashFn, HashSlots, InterceptionTable, Object, WeakObject, live_objects};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HASHER: AtomicU64 = AtomicU64::new(0);

const MIN_PRUNE: usize = 256;

#[derive(Default)]
struct Counters {
    generation: u64,
    next: HashMap<(ThreadKey, DispatchState), u64>,
}

thread_local! {
    static COUNTERS: RefCell<HashMap<u64, Counters>> = RefCell::new(HashMap::new());
}

struct Cached {
    object: WeakObject,
    hash: u64,
}

struct Cache {
    entries: HashMap<usize, Cached>,
    prune_at: usize,
}

impl Cache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            prune_at: MIN_PRUNE,
        }
    }

    fn insert(&mut self, identity: usize, cached: Cached) {
        if self.entries.len() >= self.prune_at {
            self.entries.retain(|_, c| c.object.is_alive());
            self.prune_at = (self.entries.len() * 2).max(MIN_PRUNE);
        }
        self.entries.insert(identity, cached);
    }
}

/// Counter-based hash function routed by dispatch state
pub struct DeterministicHasher {
    id: u64,
    state: Arc<ThreadState>,
    generation: AtomicU64,
    cache: RwLock<Cache>,
}

impl DeterministicHasher {
    /// Create a hasher routed by `state`
    #[must_use]
    pub fn new(state: Arc<ThreadState>) -> Self {
        Self {
            id: NEXT_HASHER.fetch_add(1, Ordering::Relaxed),
            state,
            generation: AtomicU64::new(0),
            cache: RwLock::new(Cache::new()),
        }
    }

    /// Hash `object`. `None` (unhashable) while interception is disabled
    /// and in states other than `internal` and `external`.
    pub fn hash(&self, object: &Object) -> Option<u64> {
        let Some(identity) = object.identity() else {
            return object.hash_with(&HashSlots::new());
        };
        if let Some(cached) = self.cache.read().entries.get(&identity) {
            if cached.object.is_alive() {
                return Some(cached.hash);
            }
        }

        let state = self.state.value();
        if !matches!(state, DispatchState::Internal | DispatchState::External) {
            return None;
        }
        let hash = self.next(state);
        if let Some(weak) = WeakObject::of(object) {
            self.cache.write().insert(identity, Cached { object: weak, hash });
        }
        tracing::trace!(?object, hash, %state, "hash assigned");
        Some(hash)
    }

    fn next(&self, state: DispatchState) -> u64 {
        let generation = self.generation.load(Ordering::Acquire);
        COUNTERS.with(|counters| {
            let mut counters = counters.borrow_mut();
            let counters = counters.entry(self.id).or_default();
            if counters.generation != generation {
                counters.generation = generation;
                counters.next.clear();
            }
            let counter = counters.next.entry((ThreadKey::current(), state)).or_insert(0);
            let hash = *counter;
            *counter += 1;
            hash
        })
    }

    /// This hasher as an installable hash function
    #[must_use]
    pub fn hash_fn(self: &Arc<Self>) -> HashFn {
        let hasher = Arc::clone(self);
        Arc::new(move |object: &Object| hasher.hash(object))
    }

    /// Route both hash slots through this hasher, returning the previous
    /// slot functions (object, callable)
    pub fn install(self: &Arc<Self>, slots: &HashSlots) -> (Option<HashFn>, Option<HashFn>) {
        let object = slots.set_object(Some(self.hash_fn()));
        let callable = slots.set_callable(Some(self.hash_fn()));
        (object, callable)
    }

    /// Assign hashes to everything that exists right now: first what is
    /// reachable from the loaded units in registration order, then every
    /// other live object in creation order. Returns the number of objects
    /// seeded.
    pub fn preseed(&self, table: &InterceptionTable) -> usize {
        let _internal = self.state.select(DispatchState::Internal);
        let mut seeded = 0;
        for unit in table.units() {
            for (_, object) in unit.entries() {
                seeded += self.seed(&object);
                if let Object::Type(ty) = &object {
                    for name in ty.attr_names() {
                        if let Some(attr) = ty.attr(&name) {
                            seeded += self.seed(&attr);
                        }
                    }
                }
            }
        }
        for object in live_objects() {
            seeded += self.seed(&object);
        }
        tracing::debug!(seeded, "hashes pre-seeded");
        seeded
    }

    /// Forget every assignment and counter, then pre-seed again, so the
    /// next run observes the same hash sequence as the previous one
    pub fn reset(&self, table: &InterceptionTable) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.cache.write() = Cache::new();
        self.preseed(table)
    }

    fn seed(&self, object: &Object) -> usize {
        let Some(identity) = object.identity() else {
            return 0;
        };
        let known = self
            .cache
            .read()
            .entries
            .get(&identity)
            .is_some_and(|c| c.object.is_alive());
        if known {
            return 0;
        }
        usize::from(self.hash(object).is_some())
    }

    /// Live objects with an assigned hash
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.read().entries.values().filter(|c| c.object.is_alive()).count()
    }
}

impl std::fmt::Debug for DeterministicHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicHasher")
            .field("owner", &self.state.id())
            .field("cached", &self.cached())
            .finish()
    }
}

/// A set whose iteration order is a function of the hash sequence.
///
/// Members iterate in ascending hash order; members that were unhashable
/// when inserted follow in insertion order and compare by identity.
pub struct HashOrderedSet {
    slots: Arc<HashSlots>,
    buckets: BTreeMap<u64, Vec<Object>>,
    unhashable: Vec<Object>,
}

impl HashOrderedSet {
    /// Empty set hashing through `slots`
    #[must_use]
    pub fn new(slots: Arc<HashSlots>) -> Self {
        Self {
            slots,
            buckets: BTreeMap::new(),
            unhashable: Vec::new(),
        }
    }

    /// Insert `object`; false if it is already a member
    pub fn insert(&mut self, object: Object) -> bool {
        if self.contains(&object) {
            return false;
        }
        match object.hash_with(&self.slots) {
            Some(hash) => self.buckets.entry(hash).or_default().push(object),
            None => self.unhashable.push(object),
        }
        true
    }

    /// Whether `object` is a member
    #[must_use]
    pub fn contains(&self, object: &Object) -> bool {
        let in_bucket = object
            .hash_with(&self.slots)
            .and_then(|hash| self.buckets.get(&hash))
            .is_some_and(|bucket| bucket.iter().any(|o| o.same(object)));
        in_bucket || self.unhashable.iter().any(|o| o.same(object))
    }

    /// Remove `object`; false if it was not a member
    pub fn remove(&mut self, object: &Object) -> bool {
        if let Some(hash) = object.hash_with(&self.slots) {
            if let Some(bucket) = self.buckets.get_mut(&hash) {
                if let Some(pos) = bucket.iter().position(|o| o.same(object)) {
                    bucket.remove(pos);
                    if bucket.is_empty() {
                        self.buckets.remove(&hash);
                    }
                    return true;
                }
            }
        }
        match self.unhashable.iter().position(|o| o.same(object)) {
            Some(pos) => {
                self.unhashable.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Members in iteration order
    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.buckets.values().flatten().chain(self.unhashable.iter())
    }

    /// Number of members
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum::<usize>() + self.unhashable.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.unhashable.is_empty()
    }
}

impl std::fmt::Debug for HashOrderedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::{Value, func};
    use retrace_patch::{Function, Instance, Namespace, TypeDef};

    fn setup() -> (Arc<ThreadState>, Arc<DeterministicHasher>, Arc<HashSlots>) {
        let state = Arc::new(ThreadState::new(DispatchState::Disabled));
        let hasher = Arc::new(DeterministicHasher::new(Arc::clone(&state)));
        let slots = Arc::new(HashSlots::new());
        hasher.install(&slots);
        (state, hasher, slots)
    }

    fn instance() -> Object {
        Object::from(Instance::new(TypeDef::new("Thing", Vec::new()).into_ref()))
    }

    #[test]
    fn test_disabled_is_unhashable() {
        let (_state, hasher, _) = setup();
        assert_eq!(hasher.hash(&instance()), None);
    }

    #[test]
    fn test_counters_per_state() {
        let (state, hasher, slots) = setup();
        let _id = ThreadKey::root().enter();
        let (a, b, c) = (instance(), instance(), instance());

        let _g = state.select(DispatchState::External);
        assert_eq!(a.hash_with(&slots), Some(0));
        assert_eq!(b.hash_with(&slots), Some(1));
        assert_eq!(a.hash_with(&slots), Some(0));
        {
            let _g = state.select(DispatchState::Internal);
            assert_eq!(c.hash_with(&slots), Some(0));
            let _g = state.select(DispatchState::Gc);
            assert_eq!(instance().hash_with(&slots), None);
        }
        assert_eq!(hasher.cached(), 3);
    }

    #[test]
    fn test_dead_objects_leave_cache() {
        let (state, hasher, _) = setup();
        let _id = ThreadKey::root().enter();
        let _g = state.select(DispatchState::External);
        let first = instance();
        assert_eq!(hasher.hash(&first), Some(0));
        drop(first);
        assert_eq!(hasher.cached(), 0);
        assert_eq!(hasher.hash(&instance()), Some(1));
    }

    #[test]
    fn test_values_hash_by_content() {
        let (state, hasher, _) = setup();
        let _g = state.select(DispatchState::External);
        let a = Object::from(Value::from("x"));
        assert_eq!(hasher.hash(&a), hasher.hash(&Object::from(Value::from("x"))));
    }

    #[test]
    fn test_preseed_follows_unit_order() {
        let (state, hasher, slots) = setup();
        let _id = ThreadKey::root().enter();
        let ty = TypeDef::new("Clock", Vec::new())
            .with_attr("now", Object::from(Function::new("now", func(|_| Ok(Value::Unit)))))
            .into_ref();
        let f = Function::new("sleep", func(|_| Ok(Value::Unit)));
        let table = InterceptionTable::new();
        table.register(
            Namespace::new("time")
                .with("sleep", Arc::clone(&f))
                .with("Clock", Arc::clone(&ty))
                .with("EPOCH", Value::Int(0))
                .into_ref(),
        );

        assert!(hasher.preseed(&table) >= 3);
        assert_eq!(state.value(), DispatchState::Disabled);
        let _g = state.select(DispatchState::Internal);
        assert_eq!(Object::from(f).hash_with(&slots), Some(0));
        assert_eq!(Object::from(ty).hash_with(&slots), Some(1));
    }

    #[test]
    fn test_preseed_covers_objects_outside_units() {
        let (_state, hasher, slots) = setup();
        let _id = ThreadKey::root().enter();
        let loose = instance();
        assert_eq!(loose.hash_with(&slots), None);

        assert!(hasher.preseed(&InterceptionTable::new()) >= 1);
        assert!(loose.hash_with(&slots).is_some());
    }

    #[test]
    fn test_reset_repeats_hash_sequence() {
        let (state, hasher, slots) = setup();
        let _id = ThreadKey::root().enter();
        let table = InterceptionTable::new();
        let existing = instance();

        let mut runs = Vec::new();
        for _ in 0..2 {
            hasher.reset(&table);
            let _g = state.select(DispatchState::External);
            let fresh = instance();
            runs.push((fresh.hash_with(&slots), instance().hash_with(&slots)));
        }
        assert_eq!(runs[0], (Some(0), Some(1)));
        assert_eq!(runs[0], runs[1]);
        assert!(existing.hash_with(&slots).is_some());
    }

    #[test]
    fn test_counters_are_per_thread() {
        let (state, _hasher, slots) = setup();
        let _id = ThreadKey::root().enter();
        let _g = state.select(DispatchState::External);
        assert_eq!(instance().hash_with(&slots), Some(0));
        assert_eq!(instance().hash_with(&slots), Some(1));

        let worker_state = Arc::clone(&state);
        let worker_slots = Arc::clone(&slots);
        let worker = std::thread::spawn(move || {
            let _id = ThreadKey::root().child(0).enter();
            let _g = worker_state.select(DispatchState::External);
            instance().hash_with(&worker_slots)
        });
        assert_eq!(worker.join().unwrap(), Some(0));
        assert_eq!(instance().hash_with(&slots), Some(2));
    }

    #[test]
    fn test_ordered_set_follows_hash_order() {
        let (state, _hasher, slots) = setup();
        let _id = ThreadKey::root().enter();
        let items: Vec<Object> = (0..5).map(|_| instance()).collect();

        let _g = state.select(DispatchState::External);
        for item in &items {
            item.hash_with(&slots);
        }
        let mut set = HashOrderedSet::new(Arc::clone(&slots));
        for item in items.iter().rev() {
            assert!(set.insert(item.clone()));
        }
        assert!(!set.insert(items[2].clone()));
        let order: Vec<bool> = set.iter().zip(&items).map(|(a, b)| a.same(b)).collect();
        assert_eq!(order, vec![true; 5]);

        assert!(set.remove(&items[0]));
        assert!(!set.contains(&items[0]));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_ordered_set_unhashable_members() {
        let (state, _hasher, slots) = setup();
        let mut set = HashOrderedSet::new(Arc::clone(&slots));
        let a = instance();
        assert!(set.insert(a.clone()));
        assert!(!set.insert(a.clone()));
        assert!(set.contains(&a));

        let _g = state.select(DispatchState::External);
        let b = instance();
        set.insert(b.clone());
        let order: Vec<bool> = set.iter().map(|o| o.same(&b)).collect();
        assert_eq!(order, vec![true, false]);
    }
}
