//! Error taxonomy for RETRACE.
//!
//! Every failure the record/replay machinery can raise is one of these
//! kinds. Program exceptions are not errors of this type: they travel as
//! [`Raised`](crate::value::Raised) values and are recorded verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type used across the workspace
pub type RetraceResult<T> = Result<T, RetraceError>;

/// System-level failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetraceError {
    /// Failure while producing the event stream
    #[error("Record error: {reason}")]
    Record {
        /// What went wrong
        reason: String,
    },

    /// Failure while consuming the event stream
    #[error("Replay error: {reason}")]
    Replay {
        /// What went wrong
        reason: String,
    },

    /// Replay asked for more events than the thread recorded
    #[error("Recording exhausted for thread {thread} after {consumed} events")]
    Exhausted {
        /// Logical thread whose subsequence ran dry
        thread: String,
        /// Events that were consumed before running dry
        consumed: usize,
    },

    /// Invalid configuration, malformed header, or patching failure
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What went wrong
        reason: String,
    },

    /// Recording made by an incompatible runtime or format
    #[error("Version mismatch: {reason}")]
    VersionMismatch {
        /// What differs
        reason: String,
    },

    /// No recording at the given location
    #[error("Recording not found: {path}")]
    RecordingNotFound {
        /// Location that was looked up
        path: String,
    },

    /// Replay observably differs from the recording
    #[error("{0}")]
    Divergence(Box<Divergence>),
}

impl RetraceError {
    /// Shorthand for a [`RetraceError::Record`]
    pub fn record(reason: impl Into<String>) -> Self {
        Self::Record {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`RetraceError::Replay`]
    pub fn replay(reason: impl Into<String>) -> Self {
        Self::Replay {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`RetraceError::Configuration`]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`RetraceError::VersionMismatch`]
    pub fn version_mismatch(reason: impl Into<String>) -> Self {
        Self::VersionMismatch {
            reason: reason.into(),
        }
    }

    /// Wrap a divergence
    #[must_use]
    pub fn divergence(divergence: Divergence) -> Self {
        Self::Divergence(Box::new(divergence))
    }

    /// Whether this failure happened while consuming a recording
    #[must_use]
    pub const fn is_replay_error(&self) -> bool {
        matches!(self, Self::Replay { .. } | Self::Exhausted { .. })
    }

    /// Process exit status for a run that ended with this error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Record { .. } => 1,
            Self::Replay { .. } | Self::Exhausted { .. } => 2,
            Self::Configuration { .. } => 3,
            Self::VersionMismatch { .. } => 4,
            Self::RecordingNotFound { .. } => 5,
            Self::Divergence(_) => 6,
        }
    }

    /// Divergence details, if this is a divergence
    #[must_use]
    pub fn as_divergence(&self) -> Option<&Divergence> {
        match self {
            Self::Divergence(d) => Some(d),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RetraceError {
    fn from(err: std::io::Error) -> Self {
        Self::Replay {
            reason: err.to_string(),
        }
    }
}

/// What kind of difference was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceKind {
    /// A checkpoint label or position differs
    Checkpoint,
    /// A different event kind was found where a result was expected
    Structure,
    /// Call/return trace differs
    Trace,
    /// Recorded events were left unconsumed
    Unconsumed,
    /// Replay made more guarded calls than the recording holds
    Overrun,
    /// The final outcome differs
    Outcome,
}

impl fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Checkpoint => "checkpoint",
            Self::Structure => "structure",
            Self::Trace => "trace",
            Self::Unconsumed => "unconsumed",
            Self::Overrun => "overrun",
            Self::Outcome => "outcome",
        };
        f.write_str(name)
    }
}

/// A replay divergence with enough context for post-mortem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    /// Kind of difference
    pub kind: DivergenceKind,
    /// Human readable description
    pub message: String,
    /// The recorded events, rendered one per entry
    pub events: Vec<String>,
    /// Number of events consumed before the divergence
    pub consumed: usize,
}

impl Divergence {
    /// Create a divergence without event context
    pub fn new(kind: DivergenceKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            events: Vec::new(),
            consumed: 0,
        }
    }

    /// Attach the recorded event list and consumed count
    #[must_use]
    pub fn with_events(mut self, events: Vec<String>, consumed: usize) -> Self {
        self.events = events;
        self.consumed = consumed;
        self
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Replay divergence ({}): {}", self.kind, self.message)
    }
}
