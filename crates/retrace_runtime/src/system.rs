//! The record/replay system.
//!
//! A [`System`] owns one dispatch state, the interception table of loaded
//! code units, and the patch engine that rewires them. Guarded functions
//! installed by the engine consult the calling thread's active
//! [`Context`] to decide whether to record, replay or pass through.

use crate::context::{Context, Mode, Scope};
use crate::fork::ForkPath;
use crate::hashing::{DeterministicHasher, HashOrderedSet};
use crate::install::Installation;
use crate::proxy;
use crate::thread::SpawnPolicy;
use parking_lot::Mutex;
use retrace_core::{CallResult, DispatchState, Func, RetraceResult, ThreadState, Value};
use retrace_log::{CallSite, RecordingOptions, StreamReader, StreamWriter};
use retrace_patch::{
    Container, Function, HashFn, HashSlots, ImmutableTypeSet, InterceptionTable, Namespace, Object,
    ObjectKey, PatchEngine, PatchHost, PatchSpec, ReferenceIndex,
};
use retrace_replay::{DetectorConfig, DivergenceDetector};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// System configuration
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    /// State and context given to spawned threads
    pub spawn_policy: SpawnPolicy,
    /// Replay trace comparison
    pub detector: DetectorConfig,
}

impl SystemConfig {
    /// Set the spawn policy
    #[must_use]
    pub fn with_spawn_policy(mut self, policy: SpawnPolicy) -> Self {
        self.spawn_policy = policy;
        self
    }

    /// Set the detector configuration
    #[must_use]
    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }
}

#[derive(Default)]
struct Bindings {
    next: u64,
    indices: HashMap<ObjectKey, u64>,
    objects: BTreeMap<u64, Object>,
}

thread_local! {
    static FRAMES: RefCell<HashMap<u64, Vec<CallSite>>> = RefCell::new(HashMap::new());
}

/// State shared by a system and the guarded functions it installs
pub(crate) struct Core {
    pub(crate) id: u64,
    pub(crate) state: Arc<ThreadState>,
    pub(crate) immutable: ImmutableTypeSet,
    pub(crate) hasher: Arc<DeterministicHasher>,
    bindings: Mutex<Bindings>,
}

impl Core {
    /// Context of this system, if the calling thread is in `external`
    pub(crate) fn active(&self) -> Option<Arc<Context>> {
        if self.state.value() != DispatchState::External {
            return None;
        }
        Context::current(self.id)
    }

    /// Traced frames of the calling thread followed by `innermost`
    pub(crate) fn stack_for(&self, innermost: &str) -> Vec<String> {
        let mut frames: Vec<String> = FRAMES
            .try_with(|frames| {
                frames
                    .borrow()
                    .get(&self.id)
                    .map(|f| f.iter().map(ToString::to_string).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        frames.push(innermost.to_string());
        frames
    }

    fn push_frame(&self, site: CallSite) {
        let _ = FRAMES.try_with(|frames| {
            frames.borrow_mut().entry(self.id).or_default().push(site);
        });
    }

    fn pop_frame(&self) {
        let _ = FRAMES.try_with(|frames| {
            if let Some(stack) = frames.borrow_mut().get_mut(&self.id) {
                stack.pop();
            }
        });
    }

    fn bind(&self, object: &Object) {
        let Some(key) = ObjectKey::of(object) else {
            tracing::trace!(?object, "plain values are not bound");
            return;
        };
        let mut bindings = self.bindings.lock();
        if bindings.indices.contains_key(&key) {
            return;
        }
        let index = bindings.next;
        bindings.next += 1;
        bindings.indices.insert(key, index);
        bindings.objects.insert(index, object.clone());
        tracing::trace!(?object, index, "object bound");
    }

    fn unbind(&self, object: &Object) {
        let Some(key) = ObjectKey::of(object) else {
            return;
        };
        let mut bindings = self.bindings.lock();
        if let Some(index) = bindings.indices.remove(&key) {
            bindings.objects.remove(&index);
        }
    }
}

struct Host(Arc<Core>);

impl PatchHost for Host {
    fn proxy(&self, qualname: &str, function: &Arc<Function>) -> RetraceResult<Arc<Function>> {
        Ok(proxy::proxy(&self.0, qualname, function))
    }

    fn disable(&self, function: &Arc<Function>) -> Arc<Function> {
        Function::new(function.name(), self.0.state.disable_for(function.body().clone()))
    }

    fn bind(&self, object: &Object) {
        self.0.bind(object);
    }

    fn unbind(&self, object: &Object) {
        self.0.unbind(object);
    }

    fn deterministic_hash(&self) -> HashFn {
        self.0.hasher.hash_fn()
    }

    fn immutable_types(&self) -> &ImmutableTypeSet {
        &self.0.immutable
    }
}

/// A record/replay system
pub struct System {
    pub(crate) core: Arc<Core>,
    config: SystemConfig,
    slots: Arc<HashSlots>,
    table: Arc<InterceptionTable>,
    refs: Arc<ReferenceIndex>,
    engine: Arc<PatchEngine>,
    installation: Installation,
}

impl System {
    /// Create a system applying `spec`. Nothing is patched until
    /// [`install`](Self::install).
    #[must_use]
    pub fn new(spec: PatchSpec, config: SystemConfig) -> Self {
        let state = Arc::new(ThreadState::new(DispatchState::Disabled));
        let core = Arc::new(Core {
            id: state.id(),
            hasher: Arc::new(DeterministicHasher::new(Arc::clone(&state))),
            state,
            immutable: ImmutableTypeSet::new(),
            bindings: Mutex::new(Bindings::default()),
        });
        let table = Arc::new(InterceptionTable::new());
        let refs = Arc::new(ReferenceIndex::new());
        let engine = Arc::new(PatchEngine::new(
            spec,
            Arc::new(Host(Arc::clone(&core))),
            Arc::clone(&table),
            Arc::clone(&refs),
        ));
        Self {
            core,
            config,
            slots: Arc::new(HashSlots::new()),
            table,
            refs,
            engine,
            installation: Installation::new(),
        }
    }

    /// Unique id of this system
    #[must_use]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Per-thread dispatch state
    #[must_use]
    pub fn thread_state(&self) -> &Arc<ThreadState> {
        &self.core.state
    }

    /// Loaded code units
    #[must_use]
    pub fn table(&self) -> &Arc<InterceptionTable> {
        &self.table
    }

    /// Containers whose references are rewritten when a loaded unit is
    /// patched
    #[must_use]
    pub fn references(&self) -> &Arc<ReferenceIndex> {
        &self.refs
    }

    /// Patch engine
    #[must_use]
    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    /// Types exempt from proxying
    #[must_use]
    pub fn immutable_types(&self) -> &ImmutableTypeSet {
        &self.core.immutable
    }

    /// Hash slots objects and functions hash through
    #[must_use]
    pub fn hash_slots(&self) -> &Arc<HashSlots> {
        &self.slots
    }

    /// Record context writing to `writer`
    #[must_use]
    pub fn record_context(&self, writer: Arc<StreamWriter>, capture_stacks: bool) -> Scope {
        let options = RecordingOptions {
            stacktraces: capture_stacks,
            ..RecordingOptions::default()
        };
        self.record_context_with(writer, options)
    }

    /// Record context with explicit options
    #[must_use]
    pub fn record_context_with(&self, writer: Arc<StreamWriter>, options: RecordingOptions) -> Scope {
        tracing::debug!(system = self.id(), ?options, "record context created");
        self.begin_run();
        Scope::new(Context::new(
            self.id(),
            Arc::clone(&self.core.state),
            Mode::Record { writer, options },
        ))
    }

    /// Replay context reading from `reader`
    #[must_use]
    pub fn replay_context(&self, reader: Arc<StreamReader>) -> Scope {
        self.replay_context_with(reader, RecordingOptions::default(), ForkPath::parent())
    }

    /// Replay context for a recording made with `options`, following
    /// `fork_path` at duplication points
    #[must_use]
    pub fn replay_context_with(
        &self,
        reader: Arc<StreamReader>,
        options: RecordingOptions,
        fork_path: ForkPath,
    ) -> Scope {
        tracing::debug!(system = self.id(), ?options, %fork_path, "replay context created");
        self.begin_run();
        let detector = Arc::new(DivergenceDetector::new(
            Arc::clone(&reader),
            self.config.detector.clone(),
        ));
        Scope::new(Context::new(
            self.id(),
            Arc::clone(&self.core.state),
            Mode::Replay {
                reader,
                options,
                detector,
                fork_path: Arc::new(fork_path),
            },
        ))
    }

    fn begin_run(&self) {
        if self.installation.is_active() {
            self.core.hasher.reset(&self.table);
        }
    }

    /// Context of this system active on the calling thread
    #[must_use]
    pub fn current_context(&self) -> Option<Arc<Context>> {
        Context::current(self.id())
    }

    /// Install the hash slots and patch every unit loaded so far. Units
    /// loaded afterwards are patched as they load.
    ///
    /// # Errors
    ///
    /// Returns the first patching failure; everything installed before it
    /// is uninstalled again
    pub fn install(&self) -> RetraceResult<()> {
        if self.installation.is_active() {
            return Ok(());
        }
        let _internal = self.core.state.select(DispatchState::Internal);
        self.installation.activate();

        let (object, callable) = self.core.hasher.install(&self.slots);
        let slots = Arc::clone(&self.slots);
        self.installation.push("hash slots", move || {
            slots.set_object(object);
            slots.set_callable(callable);
        });
        self.core.hasher.preseed(&self.table);

        let engine = Arc::clone(&self.engine);
        self.installation.push("patches", move || {
            engine.uninstall();
        });
        if let Err(err) = self.engine.patch_loaded() {
            self.installation.uninstall();
            return Err(err);
        }
        tracing::debug!(system = self.id(), units = self.table.len(), "system installed");
        Ok(())
    }

    /// Undo [`install`](Self::install) in reverse order. Calling it again
    /// does nothing. Returns the number of steps undone.
    pub fn uninstall(&self) -> usize {
        self.installation.uninstall()
    }

    /// Whether the system is installed
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installation.is_active()
    }

    /// Register a code unit. Once installed, the unit is patched right away
    /// and the load is marked in the event stream. Returns whether the
    /// unit was patched.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if patching fails, or a divergence if
    /// the load happens at a different point than recorded
    pub fn load_unit(&self, unit: Arc<Namespace>) -> RetraceResult<bool> {
        if self.core.active().is_some() {
            self.sync();
            self.checkpoint(format!("exec module: {}", unit.name()))?;
        }
        let _importing = self.core.state.select(DispatchState::Importing);
        self.table.register(Arc::clone(&unit));
        self.refs.register(&(Arc::clone(&unit) as Arc<dyn Container>));
        if !self.installation.is_active() {
            return Ok(false);
        }
        self.engine.patch_unit(&unit, false)
    }

    /// Call `path` (`unit.attr` or `unit.Type.attr`) through the
    /// interception table
    pub fn call(&self, path: &str, args: &[Value]) -> CallResult {
        self.table.call(path, args)
    }

    /// Wrap `f` so it always runs with interception disabled
    #[must_use]
    pub fn disable_for(&self, f: Func) -> Func {
        self.core.state.disable_for(f)
    }

    /// Mark a synchronization point. Written on record, compared on replay;
    /// a no-op outside a context.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint divergence if the replayed label differs
    pub fn checkpoint(&self, label: impl Into<Value>) -> RetraceResult<()> {
        let Some(ctx) = self.core.active() else {
            return Ok(());
        };
        match ctx.mode() {
            Mode::Record { writer, .. } => writer.checkpoint(label),
            Mode::Replay { reader, .. } => reader.checkpoint(label),
        }
    }

    /// Emit a monitoring sample
    ///
    /// # Errors
    ///
    /// Returns a divergence if the replayed sample differs
    pub fn monitor(&self, value: Value) -> RetraceResult<()> {
        let Some(ctx) = self.core.active() else {
            return Ok(());
        };
        match ctx.mode() {
            Mode::Record { writer, options } if options.monitor > 0 => writer.monitor(value),
            Mode::Record { .. } => Ok(()),
            Mode::Replay { reader, .. } => reader.monitor_checkpoint(value),
        }
    }

    /// Stop tracing calls on the calling thread until its next guarded
    /// result
    pub fn sync(&self) {
        let Some(ctx) = self.core.active() else {
            return;
        };
        match ctx.mode() {
            Mode::Record { writer, .. } => writer.sync(),
            Mode::Replay { detector, .. } => detector.sync(),
        }
    }

    /// A traced function was entered
    ///
    /// # Errors
    ///
    /// Returns a trace divergence on replay if the recording differs
    pub fn trace_call(&self, site: CallSite) -> RetraceResult<()> {
        let Some(ctx) = self.core.active() else {
            return Ok(());
        };
        self.core.push_frame(site.clone());
        if !ctx.options().trace_calls {
            return Ok(());
        }
        match ctx.mode() {
            Mode::Record { writer, .. } => writer.function_call(site),
            Mode::Replay { detector, .. } => detector.on_call(&site),
        }
    }

    /// A traced function returned
    ///
    /// # Errors
    ///
    /// Returns a trace divergence on replay if the recording differs
    pub fn trace_return(&self, site: CallSite) -> RetraceResult<()> {
        let Some(ctx) = self.core.active() else {
            return Ok(());
        };
        self.core.pop_frame();
        if !ctx.options().trace_calls {
            return Ok(());
        }
        match ctx.mode() {
            Mode::Record { writer, .. } => writer.function_return(site),
            Mode::Replay { detector, .. } => detector.on_return(&site),
        }
    }

    /// Run `f` between [`trace_call`](Self::trace_call) and
    /// [`trace_return`](Self::trace_return)
    ///
    /// # Errors
    ///
    /// Returns a trace divergence on replay if the recording differs
    pub fn traced<R>(&self, site: CallSite, f: impl FnOnce() -> R) -> RetraceResult<R> {
        self.trace_call(site.clone())?;
        let result = f();
        self.trace_return(site)?;
        Ok(result)
    }

    /// Bind `object` so the stream can refer to it by index
    pub fn bind(&self, object: &Object) {
        self.core.bind(object);
    }

    /// Stream reference to a bound object
    #[must_use]
    pub fn binding(&self, object: &Object) -> Option<Value> {
        let key = ObjectKey::of(object)?;
        self.core.bindings.lock().indices.get(&key).map(|i| Value::Bound(*i))
    }

    /// Object bound at `index`
    #[must_use]
    pub fn bound(&self, index: u64) -> Option<Object> {
        self.core.bindings.lock().objects.get(&index).cloned()
    }

    /// Hash `object` through the installed hash slots
    #[must_use]
    pub fn hash(&self, object: &Object) -> Option<u64> {
        object.hash_with(&self.slots)
    }

    /// Empty set ordered by this system's hashes
    #[must_use]
    pub fn ordered_set(&self) -> HashOrderedSet {
        HashOrderedSet::new(Arc::clone(&self.slots))
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.installation.uninstall();
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("id", &self.id())
            .field("units", &self.table.len())
            .field("installed", &self.is_installed())
            .finish_non_exhaustive()
    }
}
