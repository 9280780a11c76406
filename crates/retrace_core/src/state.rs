//! Dispatch states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interception mode of the executing thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DispatchState {
    /// Interception bypassed entirely
    Disabled,
    /// Running inside a guarded operation; nested calls pass through
    Internal,
    /// Running program code under an active context; guarded calls are intercepted
    External,
    /// Loading a code unit
    Importing,
    /// Running collector-driven work such as finalizers
    Gc,
    /// Running record/replay machinery
    Retrace,
}

impl DispatchState {
    /// Number of states
    pub const COUNT: usize = 6;

    /// All states, in index order
    pub const ALL: [Self; Self::COUNT] = [
        Self::Disabled,
        Self::Internal,
        Self::External,
        Self::Importing,
        Self::Gc,
        Self::Retrace,
    ];

    /// Dense index for handler tables
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Internal => 1,
            Self::External => 2,
            Self::Importing => 3,
            Self::Gc => 4,
            Self::Retrace => 5,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Internal => "internal",
            Self::External => "external",
            Self::Importing => "importing",
            Self::Gc => "gc",
            Self::Retrace => "retrace",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown dispatch state: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_is_dense() {
        for (i, state) in DispatchState::ALL.iter().enumerate() {
            assert_eq!(state.index(), i);
        }
    }

    #[test]
    fn test_parse_roundtrip_names() {
        for state in DispatchState::ALL {
            assert_eq!(state.as_str().parse::<DispatchState>(), Ok(state));
        }
        assert!("paused".parse::<DispatchState>().is_err());
    }
}
