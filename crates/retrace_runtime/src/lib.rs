//! RETRACE Runtime
//!
//! Ties the pieces together into a record/replay [`System`]: guarded
//! proxies that write or read outcomes, record and replay contexts,
//! deterministic hashing, finalizer coordination, thread spawning and
//! process duplication. [`RecordSession`] and [`ReplaySession`] drive a
//! program against a recording file; [`TestRunner`] does the same in memory.
//!
//! ```no_run
//! use retrace_core::{CallResult, Value};
//! use retrace_patch::PatchSpec;
//! use retrace_runtime::{RecordSession, ReplaySession, System, SystemConfig};
//!
//! let system = System::new(PatchSpec::new(), SystemConfig::default());
//! system.install()?;
//! let target = |s: &System| -> CallResult {
//!     s.checkpoint("start")?;
//!     Ok(Value::Unit)
//! };
//! RecordSession::new("run.retrace").run(&system, target)?;
//! ReplaySession::new("run.retrace").run(&system, target)?;
//! # Ok::<(), retrace_core::RetraceError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod fork;
pub mod hashing;
pub mod install;
mod proxy;
pub mod runner;
pub mod session;
pub mod system;
pub mod thread;
pub mod weakref;

// Re-exports
pub use context::{Context, ContextGuard, Mode, Scope};
#[cfg(unix)]
pub use fork::OsForker;
pub use fork::{CHILD_DEPTH, ForkOutcome, ForkPath, Forker};
pub use hashing::{DeterministicHasher, HashOrderedSet};
pub use install::Installation;
pub use runner::{Diagnosis, Recording, TestRunner};
pub use session::{Outcome, RecordSession, ReplaySession, Target, split};
pub use system::{System, SystemConfig};
pub use thread::SpawnPolicy;
pub use weakref::{Callback, Finalizer, Tracked, WeakRef};
