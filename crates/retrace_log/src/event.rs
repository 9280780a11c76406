//! Event types for the event stream.
//!
//! Events are ordered per logical thread. On the wire every event travels
//! inside an [`Envelope`] naming the process and thread that produced it.

use crate::encoding::CanonicalEncode;
use retrace_core::{ProcessKey, Raised, ThreadKey, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event kind - type of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Inputs of a guarded call
    Call,
    /// Guarded call returned
    Result,
    /// Guarded call raised
    Error,
    /// Synchronization point
    Checkpoint,
    /// Traced function entered
    FunctionCall,
    /// Traced function left
    FunctionReturn,
    /// Finalizer started
    WeakrefCallbackStart,
    /// Finalizer finished
    WeakrefCallbackEnd,
    /// Monitoring sample
    Monitor,
}

impl EventKind {
    /// Call-trace instrumentation, only compared by the divergence detector
    pub const fn is_instrumentation(self) -> bool {
        matches!(self, Self::FunctionCall | Self::FunctionReturn)
    }

    /// Finalizer brackets, skipped on replay
    pub const fn is_bracket(self) -> bool {
        matches!(self, Self::WeakrefCallbackStart | Self::WeakrefCallbackEnd)
    }

    /// Events a replay must consume one-for-one
    pub const fn is_tape(self) -> bool {
        matches!(self, Self::Call | Self::Result | Self::Error | Self::Checkpoint)
    }
}

/// Location of a traced function
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    /// Qualified function name
    pub qualname: String,
    /// Source file
    pub file: String,
    /// First line of the function
    pub line: u32,
}

impl CallSite {
    /// Create a call site
    pub fn new(qualname: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            qualname: qualname.into(),
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.qualname, self.file, self.line)
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// Inputs of a guarded call, written when input tracing is on
    Call {
        /// Qualified name of the callee
        name: String,
        /// Arguments as passed
        args: Vec<Value>,
    },
    /// Successful outcome of a guarded call
    Result(Value),
    /// Exception raised by a guarded call
    Error(Raised),
    /// Labeled synchronization point
    Checkpoint(Value),
    /// Entry into a traced function
    FunctionCall(CallSite),
    /// Exit from a traced function
    FunctionReturn(CallSite),
    /// A wrapped finalizer is about to run
    WeakrefCallbackStart,
    /// A wrapped finalizer finished, normally or not
    WeakrefCallbackEnd,
    /// Monitoring sample
    Monitor(Value),
}

/// A RETRACE event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened
    pub payload: EventPayload,
    /// Stack captured at the time of the write, innermost frame last
    pub stack: Option<Vec<String>>,
}

impl Event {
    /// Event without a captured stack
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            stack: None,
        }
    }

    /// Attach a captured stack
    #[must_use]
    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Kind of the payload
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Call { .. } => EventKind::Call,
            EventPayload::Result(_) => EventKind::Result,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::Checkpoint(_) => EventKind::Checkpoint,
            EventPayload::FunctionCall(_) => EventKind::FunctionCall,
            EventPayload::FunctionReturn(_) => EventKind::FunctionReturn,
            EventPayload::WeakrefCallbackStart => EventKind::WeakrefCallbackStart,
            EventPayload::WeakrefCallbackEnd => EventKind::WeakrefCallbackEnd,
            EventPayload::Monitor(_) => EventKind::Monitor,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            EventPayload::Call { name, args } => {
                write!(f, "call {}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            EventPayload::Result(v) => write!(f, "result {}", v),
            EventPayload::Error(r) => write!(f, "error {}", r),
            EventPayload::Checkpoint(v) => write!(f, "checkpoint {}", v),
            EventPayload::FunctionCall(site) => write!(f, "fcall {}", site),
            EventPayload::FunctionReturn(site) => write!(f, "fret {}", site),
            EventPayload::WeakrefCallbackStart => write!(f, "weakref callback start"),
            EventPayload::WeakrefCallbackEnd => write!(f, "weakref callback end"),
            EventPayload::Monitor(v) => write!(f, "monitor {}", v),
        }
    }
}

/// Physical framing of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Process that wrote the event
    pub process: ProcessKey,
    /// Logical thread that wrote the event
    pub thread: ThreadKey,
    /// The event itself
    pub event: Event,
}

impl CanonicalEncode for Envelope {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        let event = Event::new(EventPayload::Result(Value::Int(1)));
        assert_eq!(event.kind(), EventKind::Result);
        assert!(event.kind().is_tape());
        assert!(!event.kind().is_instrumentation());

        let event = Event::new(EventPayload::FunctionCall(CallSite::new("f", "a.rs", 1)));
        assert!(event.kind().is_instrumentation());
        assert!(!event.kind().is_tape());

        assert!(EventKind::WeakrefCallbackEnd.is_bracket());
    }

    #[test]
    fn test_event_display() {
        let event = Event::new(EventPayload::Call {
            name: "time.now".to_string(),
            args: vec![Value::Int(1), Value::from("x")],
        });
        assert_eq!(event.to_string(), "call time.now(1, \"x\")");

        let event = Event::new(EventPayload::Error(Raised::new("OSError", "denied")));
        assert_eq!(event.to_string(), "error OSError: denied");
    }

    #[test]
    fn test_event_with_stack() {
        let event = Event::new(EventPayload::Checkpoint(Value::from("a")))
            .with_stack(vec!["main".to_string(), "run".to_string()]);
        assert_eq!(event.stack.as_deref().map(<[String]>::len), Some(2));
    }
}
