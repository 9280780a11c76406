//! Thread spawning.
//!
//! Spawned threads get a hierarchical [`ThreadKey`] derived from the
//! spawning thread's key and spawn count, so the same program spawns the
//! same keys on record and replay. What dispatch state and context the new
//! thread starts with is decided by the [`SpawnPolicy`].

use crate::context::{Context, Scope};
use crate::system::System;
use retrace_core::{DispatchState, RetraceError, RetraceResult, ThreadKey};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Initial state of threads started through [`System::spawn`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpawnPolicy {
    /// Enter the spawning thread's context in `external` if the spawning
    /// thread is in `external`; otherwise start `disabled` without a context
    #[default]
    ExternalOnly,
    /// Copy the spawning thread's state and context unconditionally
    Inherit,
}

enum Start {
    Bare,
    State(DispatchState),
    Context(Arc<Context>, DispatchState),
}

impl System {
    /// Spawn a thread running `f` under this system's spawn policy
    ///
    /// # Errors
    ///
    /// Returns error if the OS refuses to start the thread
    pub fn spawn<F, R>(&self, f: F) -> RetraceResult<JoinHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let key = ThreadKey::next_child();
        let state = self.core.state.value();
        let context = self.current_context();
        let start = match (self.config().spawn_policy, context) {
            (SpawnPolicy::ExternalOnly, Some(ctx)) if state == DispatchState::External => {
                Start::Context(ctx, DispatchState::External)
            }
            (SpawnPolicy::ExternalOnly, _) => Start::Bare,
            (SpawnPolicy::Inherit, Some(ctx)) => Start::Context(ctx, state),
            (SpawnPolicy::Inherit, None) => Start::State(state),
        };
        tracing::debug!(%key, policy = ?self.config().spawn_policy, %state, "spawning thread");

        let thread_state = Arc::clone(&self.core.state);
        std::thread::Builder::new()
            .name(format!("retrace-{}", key))
            .spawn(move || {
                let _identity = key.enter();
                match start {
                    Start::Bare => f(),
                    Start::State(state) => {
                        let _state = thread_state.select_owned(state);
                        f()
                    }
                    Start::Context(ctx, state) => {
                        let _context = Scope::from_context(ctx).enter_in(state);
                        f()
                    }
                }
            })
            .map_err(|e| RetraceError::record(format!("cannot spawn thread: {}", e)))
    }
}
