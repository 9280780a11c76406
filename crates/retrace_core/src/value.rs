//! Values that cross the interception boundary.
//!
//! Everything a guarded call receives or returns is a [`Value`]; program
//! exceptions are [`Raised`]. Both are serializable so they can be written
//! to the event stream as-is.

use crate::error::RetraceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A recordable value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// No value
    #[default]
    Unit,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered list
    List(Vec<Value>),
    /// String-keyed map with stable ordering
    Map(BTreeMap<String, Value>),
    /// Reference to a pre-bound object, by binding index
    Bound(u64),
}

impl Value {
    /// Integer payload, if any
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// String payload, if any
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Binding index, if this refers to a bound object
    #[must_use]
    pub const fn as_bound(&self) -> Option<u64> {
        match self {
            Self::Bound(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "()"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Bytes(b) => write!(f, "b\"{}\"", hex::encode(b)),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Self::Bound(i) => write!(f, "<bound #{}>", i),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

/// An exception raised by program code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Raised {
    /// Exception type name
    pub kind: String,
    /// Exception message
    pub message: String,
}

impl Raised {
    /// Create a raised exception
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Failure of a guarded call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// Program exception, recorded and replayed verbatim
    #[error(transparent)]
    Raised(#[from] Raised),
    /// Record/replay machinery failure, never recorded
    #[error(transparent)]
    Retrace(#[from] RetraceError),
}

impl CallError {
    /// The program exception, if this is one
    #[must_use]
    pub fn as_raised(&self) -> Option<&Raised> {
        match self {
            Self::Raised(r) => Some(r),
            Self::Retrace(_) => None,
        }
    }
}

/// Outcome of a guarded call
pub type CallResult = Result<Value, CallError>;

/// A guarded callable
pub type Func = Arc<dyn Fn(&[Value]) -> CallResult + Send + Sync>;

/// Wrap a closure as a [`Func`]
pub fn func<F>(f: F) -> Func
where
    F: Fn(&[Value]) -> CallResult + Send + Sync + 'static,
{
    Arc::new(f)
}
