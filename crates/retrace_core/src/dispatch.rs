//! Per-thread dispatch.
//!
//! A [`ThreadState`] owns one state stack per OS thread. The stacks live in
//! thread-local storage keyed by the owner's id, so lookups never take a
//! lock and several independent owners can coexist in one process.
//!
//! Guarded callables are built with [`Dispatch`]: a fixed table of handlers
//! indexed by [`DispatchState::index`], with a default for empty slots.

use crate::state::DispatchState;
use crate::value::{CallResult, Func, Value};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum nesting depth of a state stack
pub const MAX_DEPTH: usize = 64;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

struct Stack {
    owner: u64,
    items: [DispatchState; MAX_DEPTH],
    len: usize,
}

impl Stack {
    fn new(owner: u64, base: DispatchState) -> Self {
        Self {
            owner,
            items: [base; MAX_DEPTH],
            len: 1,
        }
    }

    fn top(&self) -> DispatchState {
        self.items[self.len - 1]
    }
}

thread_local! {
    static STACKS: RefCell<Vec<Stack>> = const { RefCell::new(Vec::new()) };
}

/// Owner of the per-thread dispatch state
#[derive(Debug)]
pub struct ThreadState {
    id: u64,
    default: DispatchState,
}

impl ThreadState {
    /// Create a new owner. Threads that never touched it report `default`.
    #[must_use]
    pub fn new(default: DispatchState) -> Self {
        Self {
            id: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            default,
        }
    }

    /// Owner id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// State of threads with no pushed states
    #[must_use]
    pub const fn default_state(&self) -> DispatchState {
        self.default
    }

    /// Current state of the calling thread
    #[must_use]
    pub fn value(&self) -> DispatchState {
        STACKS
            .try_with(|stacks| {
                stacks
                    .borrow()
                    .iter()
                    .find(|s| s.owner == self.id)
                    .map_or(self.default, Stack::top)
            })
            .unwrap_or(self.default)
    }

    /// Number of states pushed on the calling thread
    #[must_use]
    pub fn depth(&self) -> usize {
        STACKS
            .try_with(|stacks| {
                stacks
                    .borrow()
                    .iter()
                    .find(|s| s.owner == self.id)
                    .map_or(0, |s| s.len - 1)
            })
            .unwrap_or(0)
    }

    /// Switch the calling thread to `state` until the guard drops
    ///
    /// # Panics
    ///
    /// Panics if the stack is already [`MAX_DEPTH`] deep.
    #[must_use = "the state is restored as soon as the guard drops"]
    pub fn select(&self, state: DispatchState) -> StateGuard<'_> {
        StateGuard {
            depth: self.push(state),
            owner: self,
            _not_send: PhantomData,
        }
    }

    /// Like [`select`](Self::select), but the guard keeps the owner alive
    ///
    /// # Panics
    ///
    /// Panics if the stack is already [`MAX_DEPTH`] deep.
    #[must_use = "the state is restored as soon as the guard drops"]
    pub fn select_owned(self: &Arc<Self>, state: DispatchState) -> OwnedStateGuard {
        OwnedStateGuard {
            depth: self.push(state),
            owner: Arc::clone(self),
            _not_send: PhantomData,
        }
    }

    fn push(&self, state: DispatchState) -> usize {
        STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let pos = match stacks.iter().position(|s| s.owner == self.id) {
                Some(pos) => pos,
                None => {
                    stacks.push(Stack::new(self.id, self.default));
                    stacks.len() - 1
                }
            };
            let stack = &mut stacks[pos];
            assert!(
                stack.len < MAX_DEPTH,
                "dispatch state stack overflow ({} levels)",
                MAX_DEPTH
            );
            stack.items[stack.len] = state;
            stack.len += 1;
            stack.len
        })
    }

    fn pop(&self, expected: usize) {
        // TLS may already be gone while the thread is exiting.
        let _ = STACKS.try_with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let Some(stack) = stacks.iter_mut().find(|s| s.owner == self.id) else {
                panic!("dispatch state stack underflow");
            };
            assert!(stack.len > 1, "dispatch state stack underflow");
            if !std::thread::panicking() {
                assert_eq!(stack.len, expected, "dispatch state guards released out of order");
            }
            stack.len -= 1;
        });
    }

    /// Run `f` with the calling thread in `state`
    pub fn scoped<R>(&self, state: DispatchState, f: impl FnOnce() -> R) -> R {
        let _guard = self.select(state);
        f()
    }

    /// Wrap `f` so that it always runs in `state`
    #[must_use]
    pub fn wrap(self: &Arc<Self>, state: DispatchState, f: Func) -> Func {
        let owner = Arc::clone(self);
        Arc::new(move |args: &[Value]| owner.scoped(state, || f(args)))
    }

    /// Wrap `f` so that interception is bypassed while it runs
    #[must_use]
    pub fn disable_for(self: &Arc<Self>, f: Func) -> Func {
        self.wrap(DispatchState::Disabled, f)
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        let id = self.id;
        let _ = STACKS.try_with(|stacks| {
            if let Ok(mut stacks) = stacks.try_borrow_mut() {
                stacks.retain(|s| s.owner != id);
            }
        });
    }
}

/// Restores the previous dispatch state on drop
#[derive(Debug)]
pub struct StateGuard<'a> {
    owner: &'a ThreadState,
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.owner.pop(self.depth);
    }
}

/// [`StateGuard`] holding a shared handle to its owner
#[derive(Debug)]
pub struct OwnedStateGuard {
    owner: Arc<ThreadState>,
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for OwnedStateGuard {
    fn drop(&mut self) {
        self.owner.pop(self.depth);
    }
}

/// A callable whose behavior is selected by the current dispatch state
pub struct Dispatch {
    state: Arc<ThreadState>,
    default: Func,
    handlers: [Option<Func>; DispatchState::COUNT],
}

impl Dispatch {
    /// Create a dispatch that runs `default` in every state
    #[must_use]
    pub fn new(state: Arc<ThreadState>, default: Func) -> Self {
        Self {
            state,
            default,
            handlers: Default::default(),
        }
    }

    /// Install the handler for one state
    #[must_use]
    pub fn on(mut self, state: DispatchState, handler: Func) -> Self {
        self.handlers[state.index()] = Some(handler);
        self
    }

    /// Handler for the calling thread's current state
    #[must_use]
    pub fn select(&self) -> &Func {
        self.handlers[self.state.value().index()]
            .as_ref()
            .unwrap_or(&self.default)
    }

    /// Invoke the selected handler
    pub fn call(&self, args: &[Value]) -> CallResult {
        (self.select())(args)
    }

    /// Convert into a plain callable
    #[must_use]
    pub fn into_func(self) -> Func {
        Arc::new(move |args: &[Value]| self.call(args))
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let installed: Vec<_> = DispatchState::ALL
            .iter()
            .filter(|s| self.handlers[s.index()].is_some())
            .collect();
        f.debug_struct("Dispatch")
            .field("owner", &self.state.id())
            .field("handlers", &installed)
            .finish()
    }
}
