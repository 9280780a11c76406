//! Call trace events compared during replay.

use retrace_log::{CallSite, Event, EventPayload};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A function entry or exit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceEvent {
    /// Function entered
    Call(CallSite),
    /// Function returned
    Return(CallSite),
}

impl TraceEvent {
    /// Trace event carried by a recorded event, if any
    #[must_use]
    pub fn from_event(event: &Event) -> Option<Self> {
        match &event.payload {
            EventPayload::FunctionCall(site) => Some(Self::Call(site.clone())),
            EventPayload::FunctionReturn(site) => Some(Self::Return(site.clone())),
            _ => None,
        }
    }

    /// Location of the traced function
    #[must_use]
    pub fn site(&self) -> &CallSite {
        match self {
            Self::Call(site) | Self::Return(site) => site,
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(site) => write!(f, "fcall {}", site),
            Self::Return(site) => write!(f, "fret {}", site),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_core::Value;

    #[test]
    fn test_from_event() {
        let site = CallSite::new("app.main", "app.rs", 3);
        let call = Event::new(EventPayload::FunctionCall(site.clone()));
        assert_eq!(TraceEvent::from_event(&call), Some(TraceEvent::Call(site.clone())));
        let result = Event::new(EventPayload::Result(Value::Int(1)));
        assert_eq!(TraceEvent::from_event(&result), None);
    }

    #[test]
    fn test_display_matches_event() {
        let site = CallSite::new("app.main", "app.rs", 3);
        let event = Event::new(EventPayload::FunctionReturn(site.clone()));
        assert_eq!(TraceEvent::Return(site).to_string(), event.to_string());
    }
}
