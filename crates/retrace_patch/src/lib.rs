//! RETRACE Patch Engine
//!
//! Configuration-driven rewiring of code units at load time:
//! - An object model for code units (namespaces, functions, types)
//! - Layered TOML configuration resolved into a [`PatchSpec`]
//! - Directive application with an undo journal
//! - An interception table for qualified-name lookup at call time
//! - A backreference index for rewriting captured references
//! - The immutable type set

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directive;
pub mod engine;
pub mod immutable;
pub mod namespace;
pub mod object;
pub mod refindex;
pub mod table;

pub use config::{ConfigResolver, ConfigSource, DEFAULT_USER_DIR, StaticVersions, VersionProbe};
pub use directive::{Directive, PatchSpec, TargetArg, Targets, UnitSpec};
pub use engine::{PatchEngine, PatchHost};
pub use immutable::ImmutableTypeSet;
pub use namespace::Namespace;
pub use object::{
    Function, HashFn, HashSlots, Instance, Object, ObjectKey, Scope, TypeDef, TypeRef, WeakObject, live_objects,
};
pub use refindex::{Container, MapKey, ObjectList, ObjectMap, ObjectSet, ReferenceIndex};
pub use table::InterceptionTable;
