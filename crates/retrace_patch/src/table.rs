//! Interception table of loaded code units.
//!
//! Qualified names (`unit.attr` or `unit.Type.attr`) are resolved here at
//! call time, so a replacement installed after a caller captured the name
//! is still picked up.

use crate::namespace::Namespace;
use crate::object::Object;
use indexmap::IndexMap;
use parking_lot::RwLock;
use retrace_core::{CallResult, Raised, RetraceError, RetraceResult, Value};
use std::sync::Arc;

/// Loaded code units by name, in load order
#[derive(Debug, Default)]
pub struct InterceptionTable {
    units: RwLock<IndexMap<String, Arc<Namespace>>>,
}

impl InterceptionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit, replacing any earlier unit with the same name
    pub fn register(&self, unit: Arc<Namespace>) {
        tracing::trace!(unit = unit.name(), "unit registered");
        self.units.write().insert(unit.name().to_string(), unit);
    }

    /// Unit by name
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<Arc<Namespace>> {
        self.units.read().get(name).cloned()
    }

    /// All units in load order
    #[must_use]
    pub fn units(&self) -> Vec<Arc<Namespace>> {
        self.units.read().values().cloned().collect()
    }

    /// Number of loaded units
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    /// Whether no unit is loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a qualified name. The longest registered unit name that
    /// prefixes `path` wins; the rest is walked through attributes, then
    /// type attributes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no unit matches or an attribute is
    /// missing
    pub fn resolve(&self, path: &str) -> RetraceResult<Object> {
        let units = self.units.read();
        let mut split = path.len();
        let (unit, rest) = loop {
            let Some(pos) = path[..split].rfind('.') else {
                return Err(RetraceError::configuration(format!(
                    "cannot resolve {}: no loaded unit matches",
                    path
                )));
            };
            if let Some(unit) = units.get(&path[..pos]) {
                break (Arc::clone(unit), &path[pos + 1..]);
            }
            split = pos;
        };
        drop(units);

        let mut parts = rest.split('.');
        let first = parts.next().unwrap_or_default();
        let mut current = unit.get(first).ok_or_else(|| {
            RetraceError::configuration(format!("cannot resolve {}: {} has no {}", path, unit.name(), first))
        })?;
        for part in parts {
            let next = match &current {
                Object::Type(ty) => ty.attr(part),
                _ => None,
            };
            current = next.ok_or_else(|| {
                RetraceError::configuration(format!(
                    "cannot resolve {}: {:?} has no {}",
                    path, current, part
                ))
            })?;
        }
        Ok(current)
    }

    /// Resolve `path` and call it
    ///
    /// # Errors
    ///
    /// Raises `NameError` when the name does not resolve, otherwise whatever
    /// the callee raises
    pub fn call(&self, path: &str, args: &[Value]) -> CallResult {
        let target = self
            .resolve(path)
            .map_err(|e| Raised::new("NameError", e.to_string()))?;
        target.call(args)
    }
}
