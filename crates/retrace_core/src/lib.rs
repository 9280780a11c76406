//! RETRACE Core Types
//!
//! Dispatch states and the per-thread dispatch mechanism, the values that
//! cross the interception boundary, logical identities, checksums, versions
//! and the error taxonomy. No I/O beyond checksumming files.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod state;
pub mod value;
pub mod version;

// Re-exports
pub use checksum::{
    Checksum, ChecksumError, EXECUTABLE_KEY, checksum_tree, diff_checksums, program_checksums,
};
pub use dispatch::{Dispatch, MAX_DEPTH, OwnedStateGuard, StateGuard, ThreadState};
pub use error::{Divergence, DivergenceKind, RetraceError, RetraceResult};
pub use id::{IdentityGuard, ProcessKey, RecordingId, ThreadKey};
pub use state::DispatchState;
pub use value::{CallError, CallResult, Func, Raised, Value, func};
pub use version::{Version, VersionError};

/// Version of this runtime, stored in every recording header
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");
