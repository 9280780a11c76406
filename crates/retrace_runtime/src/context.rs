//! Record and replay contexts.
//!
//! A context binds a system to a writer or a reader. Entering it through a
//! [`Scope`] makes it the calling thread's active context and switches the
//! thread to `external`, so guarded calls start being intercepted. Scopes
//! are cheap to clone and can be entered from any thread.

use crate::fork::ForkPath;
use retrace_core::{DispatchState, OwnedStateGuard, ThreadState};
use retrace_log::{RecordingOptions, StreamReader, StreamWriter};
use retrace_replay::DivergenceDetector;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

/// What an active context does with guarded calls
#[derive(Debug)]
pub enum Mode {
    /// Write outcomes to the event stream
    Record {
        /// Destination stream
        writer: Arc<StreamWriter>,
        /// What else to capture
        options: RecordingOptions,
    },
    /// Read outcomes back from a recording
    Replay {
        /// Source stream
        reader: Arc<StreamReader>,
        /// Options the recording was made with
        options: RecordingOptions,
        /// Call trace comparison
        detector: Arc<DivergenceDetector>,
        /// Choices at duplication points
        fork_path: Arc<ForkPath>,
    },
}

/// A record or replay context of one system
#[derive(Debug)]
pub struct Context {
    system: u64,
    state: Arc<ThreadState>,
    mode: Mode,
}

thread_local! {
    static ACTIVE: RefCell<Vec<(u64, Arc<Context>)>> = const { RefCell::new(Vec::new()) };
}

impl Context {
    pub(crate) fn new(system: u64, state: Arc<ThreadState>, mode: Mode) -> Self {
        Self { system, state, mode }
    }

    /// Innermost context of `system` active on the calling thread
    #[must_use]
    pub fn current(system: u64) -> Option<Arc<Context>> {
        ACTIVE
            .try_with(|active| {
                active
                    .borrow()
                    .iter()
                    .rev()
                    .find(|(id, _)| *id == system)
                    .map(|(_, ctx)| Arc::clone(ctx))
            })
            .ok()
            .flatten()
    }

    /// Id of the owning system
    #[must_use]
    pub const fn system(&self) -> u64 {
        self.system
    }

    /// Record or replay
    #[must_use]
    pub const fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Whether this is a record context
    #[must_use]
    pub const fn is_record(&self) -> bool {
        matches!(self.mode, Mode::Record { .. })
    }

    /// Recording options in effect
    #[must_use]
    pub const fn options(&self) -> &RecordingOptions {
        match &self.mode {
            Mode::Record { options, .. } | Mode::Replay { options, .. } => options,
        }
    }

    /// Writer, in a record context
    #[must_use]
    pub fn writer(&self) -> Option<&Arc<StreamWriter>> {
        match &self.mode {
            Mode::Record { writer, .. } => Some(writer),
            Mode::Replay { .. } => None,
        }
    }

    /// Reader, in a replay context
    #[must_use]
    pub fn reader(&self) -> Option<&Arc<StreamReader>> {
        match &self.mode {
            Mode::Replay { reader, .. } => Some(reader),
            Mode::Record { .. } => None,
        }
    }

    /// Divergence detector, in a replay context
    #[must_use]
    pub fn detector(&self) -> Option<&Arc<DivergenceDetector>> {
        match &self.mode {
            Mode::Replay { detector, .. } => Some(detector),
            Mode::Record { .. } => None,
        }
    }
}

/// Reusable handle that activates a context
#[derive(Debug, Clone)]
pub struct Scope {
    context: Arc<Context>,
}

impl Scope {
    pub(crate) fn new(context: Context) -> Self {
        Self::from_context(Arc::new(context))
    }

    pub(crate) fn from_context(context: Arc<Context>) -> Self {
        Self { context }
    }

    /// The context this scope activates
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Activate the context on the calling thread in `external` until the
    /// guard drops
    #[must_use = "the context is deactivated as soon as the guard drops"]
    pub fn enter(&self) -> ContextGuard {
        self.enter_in(DispatchState::External)
    }

    /// Activate the context with the calling thread in `state`
    #[must_use = "the context is deactivated as soon as the guard drops"]
    pub fn enter_in(&self, state: DispatchState) -> ContextGuard {
        let depth = ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            active.push((self.context.system, Arc::clone(&self.context)));
            active.len()
        });
        tracing::trace!(
            system = self.context.system,
            record = self.context.is_record(),
            %state,
            "context entered"
        );
        ContextGuard {
            depth,
            _state: self.context.state.select_owned(state),
            _not_send: PhantomData,
        }
    }
}

/// Deactivates a context on drop
#[derive(Debug)]
pub struct ContextGuard {
    depth: usize,
    _state: OwnedStateGuard,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|active| {
            let mut active = active.borrow_mut();
            if !std::thread::panicking() {
                assert_eq!(active.len(), self.depth, "context guards released out of order");
            }
            active.truncate(self.depth - 1);
        });
    }
}
