//! Directive application.
//!
//! The engine walks a unit's configured directives in canonical order and
//! rewrites the unit's namespace. Everything it changes goes into an undo
//! journal; [`PatchEngine::uninstall`] replays the journal backwards.

use crate::directive::{Directive, PatchSpec, TargetArg, UnitSpec};
use crate::immutable::ImmutableTypeSet;
use crate::namespace::Namespace;
use crate::object::{Function, HashFn, Object, Scope, TypeRef};
use crate::refindex::ReferenceIndex;
use crate::table::InterceptionTable;
use parking_lot::Mutex;
use retrace_core::{RetraceError, RetraceResult};
use std::collections::HashSet;
use std::sync::Arc;

/// Services the engine needs from the runtime
pub trait PatchHost: Send + Sync {
    /// Guarded replacement for a function
    ///
    /// # Errors
    ///
    /// Returns error if the function cannot be proxied
    fn proxy(&self, qualname: &str, function: &Arc<Function>) -> RetraceResult<Arc<Function>>;

    /// Replacement that always runs with interception disabled
    fn disable(&self, function: &Arc<Function>) -> Arc<Function>;

    /// Pre-register an object for cross-run identity
    fn bind(&self, object: &Object);

    /// Forget a bound object
    fn unbind(&self, _object: &Object) {}

    /// The deterministic hash function installed by `patch_hash`
    fn deterministic_hash(&self) -> HashFn;

    /// The immutable type set
    fn immutable_types(&self) -> &ImmutableTypeSet;
}

enum Change {
    Assign {
        scope: Arc<dyn Scope>,
        name: String,
        previous: Object,
    },
    Rewrite {
        old: Object,
        new: Object,
    },
    Immutable(TypeRef),
    Hash {
        ty: TypeRef,
        previous: Option<HashFn>,
    },
    Bind(Object),
}

/// Applies a [`PatchSpec`] to code units
pub struct PatchEngine {
    spec: PatchSpec,
    host: Arc<dyn PatchHost>,
    table: Arc<InterceptionTable>,
    refs: Arc<ReferenceIndex>,
    journal: Mutex<Vec<Change>>,
    patched: Mutex<HashSet<String>>,
}

impl PatchEngine {
    /// Create an engine
    #[must_use]
    pub fn new(
        spec: PatchSpec,
        host: Arc<dyn PatchHost>,
        table: Arc<InterceptionTable>,
        refs: Arc<ReferenceIndex>,
    ) -> Self {
        Self {
            spec,
            host,
            table,
            refs,
            journal: Mutex::new(Vec::new()),
            patched: Mutex::new(HashSet::new()),
        }
    }

    /// Resolved configuration
    #[must_use]
    pub fn spec(&self) -> &PatchSpec {
        &self.spec
    }

    /// Number of journaled changes
    #[must_use]
    pub fn changes(&self) -> usize {
        self.journal.lock().len()
    }

    /// Whether `unit` has been patched
    #[must_use]
    pub fn is_patched(&self, unit: &str) -> bool {
        self.patched.lock().contains(unit)
    }

    /// Apply the unit's configured directives. With `update_refs`, every
    /// replaced object is also rewritten in the reference index. Returns
    /// false if the unit has no configuration or was already patched.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the unit, target, directive and
    /// cause of the first failing directive. Changes made before the failure
    /// stay journaled.
    pub fn patch_unit(&self, unit: &Arc<Namespace>, update_refs: bool) -> RetraceResult<bool> {
        let Some(spec) = self.spec.unit(unit.name()) else {
            return Ok(false);
        };
        if !self.patched.lock().insert(unit.name().to_string()) {
            return Ok(false);
        }
        tracing::debug!(unit = unit.name(), update_refs, "patching unit");

        let mut changes = Vec::new();
        let scope: Arc<dyn Scope> = Arc::clone(unit) as Arc<dyn Scope>;
        let result = self.apply(unit.name(), &scope, unit.name(), spec, update_refs, &mut changes);
        self.journal.lock().extend(changes);
        result.map(|()| true)
    }

    /// Patch every unit already in the interception table, rewriting
    /// references held elsewhere. Returns the number of units patched.
    ///
    /// # Errors
    ///
    /// Stops at the first failing unit
    pub fn patch_loaded(&self) -> RetraceResult<usize> {
        let mut count = 0;
        for unit in self.table.units() {
            if self.patch_unit(&unit, true)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Revert every change in reverse order. Calling it again does nothing.
    /// Returns the number of changes reverted.
    pub fn uninstall(&self) -> usize {
        let changes = std::mem::take(&mut *self.journal.lock());
        self.patched.lock().clear();
        let count = changes.len();
        for change in changes.into_iter().rev() {
            match change {
                Change::Assign { scope, name, previous } => {
                    scope.assign(&name, previous);
                }
                Change::Rewrite { old, new } => {
                    self.refs.replace_all(&new, &old);
                }
                Change::Immutable(ty) => {
                    self.host.immutable_types().remove(&ty);
                }
                Change::Hash { ty, previous } => {
                    ty.set_hash(previous);
                }
                Change::Bind(object) => self.host.unbind(&object),
            }
        }
        if count > 0 {
            tracing::debug!(reverted = count, "patches uninstalled");
        }
        count
    }

    fn apply(
        &self,
        unit: &str,
        scope: &Arc<dyn Scope>,
        prefix: &str,
        spec: &UnitSpec,
        update_refs: bool,
        changes: &mut Vec<Change>,
    ) -> RetraceResult<()> {
        for (directive, targets) in spec.directives() {
            for (name, arg) in targets.entries() {
                let Some(value) = scope.lookup(name) else {
                    continue;
                };
                let qualname = format!("{}.{}", prefix, name);
                let replacement = self
                    .apply_one(unit, directive, arg, &qualname, &value, update_refs, changes)
                    .map_err(|cause| {
                        tracing::error!(unit, target = %qualname, %directive, %cause, "patch failed");
                        RetraceError::configuration(format!(
                            "error patching {} in unit {} ({}): {}",
                            qualname, unit, directive, cause
                        ))
                    })?;

                if let Some(new) = replacement.filter(|new| !new.same(&value)) {
                    scope.assign(name, new.clone());
                    changes.push(Change::Assign {
                        scope: Arc::clone(scope),
                        name: name.to_string(),
                        previous: value.clone(),
                    });
                    if update_refs && self.refs.replace_all(&value, &new) > 0 {
                        changes.push(Change::Rewrite { old: value, new });
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_one(
        &self,
        unit: &str,
        directive: Directive,
        arg: TargetArg<'_>,
        qualname: &str,
        value: &Object,
        update_refs: bool,
        changes: &mut Vec<Change>,
    ) -> RetraceResult<Option<Object>> {
        match (directive, arg) {
            (Directive::Immutable, _) => {
                let ty = expect_type(value)?;
                if self.host.immutable_types().add(Arc::clone(ty)) {
                    changes.push(Change::Immutable(Arc::clone(ty)));
                }
                Ok(None)
            }
            (Directive::Bind, _) => {
                let members: Vec<Object> = match value {
                    Object::Type(ty) if ty.is_enum() => {
                        ty.members().iter().map(|(_, m)| m.clone()).collect()
                    }
                    other => vec![other.clone()],
                };
                for member in members {
                    self.host.bind(&member);
                    changes.push(Change::Bind(member));
                }
                Ok(None)
            }
            (Directive::PatchHash, _) => {
                let ty = expect_type(value)?;
                let previous = ty.set_hash(Some(self.host.deterministic_hash()));
                changes.push(Change::Hash {
                    ty: Arc::clone(ty),
                    previous,
                });
                Ok(None)
            }
            (Directive::Disable, _) => {
                let function = expect_function(value)?;
                Ok(Some(Object::from(self.host.disable(function))))
            }
            (Directive::Wrap, TargetArg::Path(path)) => self.table.resolve(path).map(Some),
            (Directive::PatchClass, TargetArg::Attributes(attrs)) => {
                let ty = expect_type(value)?;
                let scope: Arc<dyn Scope> = Arc::clone(ty) as Arc<dyn Scope>;
                for (attr, path) in attrs {
                    let alternate = self.table.resolve(path)?;
                    let previous = scope.assign(attr, alternate);
                    if let Some(previous) = previous {
                        changes.push(Change::Assign {
                            scope: Arc::clone(&scope),
                            name: attr.clone(),
                            previous,
                        });
                    }
                }
                Ok(None)
            }
            (Directive::TypeAttributes, TargetArg::Nested(nested)) => {
                let ty = expect_type(value)?;
                let scope: Arc<dyn Scope> = Arc::clone(ty) as Arc<dyn Scope>;
                self.apply(unit, &scope, qualname, nested, update_refs, changes)?;
                Ok(None)
            }
            (Directive::Proxy, _) => match value {
                Object::Function(f) => self.host.proxy(qualname, f).map(|p| Some(Object::from(p))),
                Object::Type(ty) => {
                    if self.host.immutable_types().contains(ty) {
                        tracing::trace!(ty = ty.name(), "immutable type not proxied");
                        return Ok(None);
                    }
                    let scope: Arc<dyn Scope> = Arc::clone(ty) as Arc<dyn Scope>;
                    for attr in ty.attr_names() {
                        let Some(Object::Function(f)) = ty.attr(&attr) else {
                            continue;
                        };
                        let proxied = self.host.proxy(&format!("{}.{}", qualname, attr), &f)?;
                        scope.assign(&attr, Object::from(proxied));
                        changes.push(Change::Assign {
                            scope: Arc::clone(&scope),
                            name: attr,
                            previous: Object::from(f),
                        });
                    }
                    Ok(None)
                }
                other => Err(RetraceError::configuration(format!(
                    "cannot proxy a {}",
                    other.kind_name()
                ))),
            },
            (directive, _) => Err(RetraceError::configuration(format!(
                "malformed targets for {}",
                directive
            ))),
        }
    }
}

fn expect_type(value: &Object) -> RetraceResult<&TypeRef> {
    value
        .as_type()
        .ok_or_else(|| RetraceError::configuration(format!("expected a type, found a {}", value.kind_name())))
}

fn expect_function(value: &Object) -> RetraceResult<&Arc<Function>> {
    value.as_function().ok_or_else(|| {
        RetraceError::configuration(format!("expected a function, found a {}", value.kind_name()))
    })
}

impl std::fmt::Debug for PatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchEngine")
            .field("units", &self.spec.len())
            .field("changes", &self.changes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Targets;
    use crate::object::{Instance, TypeDef};
    use crate::refindex::{Container, ObjectList};
    use indexmap::IndexMap;
    use retrace_core::{Value, func};

    #[derive(Default)]
    struct Host {
        immutable: ImmutableTypeSet,
        bound: Mutex<Vec<Object>>,
        proxied: Mutex<Vec<String>>,
    }

    impl PatchHost for Host {
        fn proxy(&self, qualname: &str, function: &Arc<Function>) -> RetraceResult<Arc<Function>> {
            self.proxied.lock().push(qualname.to_string());
            let inner = Arc::clone(function);
            Ok(Function::new(
                function.name(),
                func(move |args| {
                    let v = inner.call(args)?;
                    Ok(Value::List(vec![Value::from("proxied"), v]))
                }),
            ))
        }

        fn disable(&self, function: &Arc<Function>) -> Arc<Function> {
            Function::new(function.name(), function.body().clone())
        }

        fn bind(&self, object: &Object) {
            self.bound.lock().push(object.clone());
        }

        fn unbind(&self, object: &Object) {
            self.bound.lock().retain(|o| !o.same(object));
        }

        fn deterministic_hash(&self) -> HashFn {
            Arc::new(|_: &Object| Some(42))
        }

        fn immutable_types(&self) -> &ImmutableTypeSet {
            &self.immutable
        }
    }

    fn constant(name: &str, v: i64) -> Arc<Function> {
        Function::new(name, func(move |_| Ok(Value::Int(v))))
    }

    fn engine(spec: PatchSpec) -> (PatchEngine, Arc<Host>, Arc<InterceptionTable>, Arc<ReferenceIndex>) {
        let host = Arc::new(Host::default());
        let table = Arc::new(InterceptionTable::new());
        let refs = Arc::new(ReferenceIndex::new());
        let engine = PatchEngine::new(
            spec,
            Arc::clone(&host) as Arc<dyn PatchHost>,
            Arc::clone(&table),
            Arc::clone(&refs),
        );
        (engine, host, table, refs)
    }

    #[test]
    fn test_proxy_and_uninstall() {
        let spec = PatchSpec::new().with_unit("time", UnitSpec::new().with_names(Directive::Proxy, ["time", "absent"]));
        let (engine, host, _, _) = engine(spec);
        let original = constant("time", 5);
        let unit = Namespace::new("time").with("time", Arc::clone(&original)).into_ref();

        assert!(engine.patch_unit(&unit, false).unwrap());
        assert!(!engine.patch_unit(&unit, false).unwrap());
        assert_eq!(*host.proxied.lock(), vec!["time.time".to_string()]);
        assert_eq!(
            unit.get("time").unwrap().call(&[]).unwrap(),
            Value::List(vec![Value::from("proxied"), Value::Int(5)])
        );

        assert_eq!(engine.uninstall(), 1);
        assert!(unit.get("time").unwrap().same(&Object::from(original)));
        assert_eq!(engine.uninstall(), 0);
    }

    #[test]
    fn test_unconfigured_unit() {
        let (engine, _, _, _) = engine(PatchSpec::new());
        let unit = Namespace::new("json").into_ref();
        assert!(!engine.patch_unit(&unit, true).unwrap());
        assert_eq!(engine.changes(), 0);
    }

    #[test]
    fn test_immutable_types_are_not_proxied() {
        let spec = PatchSpec::new().with_unit(
            "decimal",
            UnitSpec::new()
                .with_names(Directive::Proxy, ["Decimal"])
                .with_names(Directive::Immutable, ["Decimal"]),
        );
        let (engine, host, _, _) = engine(spec);
        let ty = TypeDef::new("Decimal", vec![])
            .with_attr("add", Object::from(constant("add", 1)))
            .into_ref();
        let unit = Namespace::new("decimal").with("Decimal", Arc::clone(&ty)).into_ref();

        engine.patch_unit(&unit, false).unwrap();
        assert!(host.immutable.contains(&ty));
        assert!(host.proxied.lock().is_empty());

        engine.uninstall();
        assert!(!host.immutable.contains(&ty));
    }

    #[test]
    fn test_proxy_type_wraps_methods() {
        let spec = PatchSpec::new().with_unit("socket", UnitSpec::new().with_names(Directive::Proxy, ["Socket"]));
        let (engine, host, _, _) = engine(spec);
        let ty = TypeDef::new("Socket", vec![])
            .with_attr("recv", Object::from(constant("recv", 3)))
            .with_attr("family", Object::from(Value::Int(2)))
            .into_ref();
        let unit = Namespace::new("socket").with("Socket", Arc::clone(&ty)).into_ref();

        engine.patch_unit(&unit, false).unwrap();
        assert_eq!(*host.proxied.lock(), vec!["socket.Socket.recv".to_string()]);
        assert!(unit.get("Socket").unwrap().same(&Object::from(Arc::clone(&ty))));

        engine.uninstall();
        assert_eq!(ty.attr("recv").unwrap().call(&[]).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_bind_expands_enum_members() {
        let spec = PatchSpec::new().with_unit("signal", UnitSpec::new().with_names(Directive::Bind, ["Signals"]));
        let (engine, host, _, _) = engine(spec);
        let member = Object::from(Instance::new(TypeDef::new("Signal", vec![]).into_ref()));
        let signals = TypeDef::new("Signals", vec![])
            .with_member("SIGINT", member.clone())
            .with_member("SIGTERM", Object::from(Value::Int(15)))
            .into_ref();
        let unit = Namespace::new("signal").with("Signals", signals).into_ref();

        engine.patch_unit(&unit, false).unwrap();
        assert_eq!(host.bound.lock().len(), 2);
        assert!(host.bound.lock()[0].same(&member));
        engine.uninstall();
        assert!(host.bound.lock().is_empty());
    }

    #[test]
    fn test_patch_hash_restores_previous() {
        let spec = PatchSpec::new().with_unit("threading", UnitSpec::new().with_names(Directive::PatchHash, ["Thread"]));
        let (engine, _, _, _) = engine(spec);
        let ty = TypeDef::new("Thread", vec![]).into_ref();
        let unit = Namespace::new("threading").with("Thread", Arc::clone(&ty)).into_ref();

        engine.patch_unit(&unit, false).unwrap();
        let hash = ty.own_hash().unwrap();
        assert_eq!(hash(&Object::from(Value::Unit)), Some(42));
        engine.uninstall();
        assert!(ty.own_hash().is_none());
    }

    #[test]
    fn test_wrap_and_patch_class_resolve_through_table() {
        let replacement = constant("fast_sleep", 0);
        let start = constant("start", 9);

        let spec = PatchSpec::new().with_unit(
            "time",
            UnitSpec::new()
                .with(
                    Directive::Wrap,
                    Targets::Alternates(IndexMap::from([("sleep".to_string(), "shims.fast_sleep".to_string())])),
                )
                .with(
                    Directive::PatchClass,
                    Targets::ClassAlternates(IndexMap::from([(
                        "Timer".to_string(),
                        IndexMap::from([("start".to_string(), "shims.start".to_string())]),
                    )])),
                ),
        );
        let (engine, _, table, _) = engine(spec);
        table.register(
            Namespace::new("shims")
                .with("fast_sleep", Arc::clone(&replacement))
                .with("start", Arc::clone(&start))
                .into_ref(),
        );
        let timer = TypeDef::new("Timer", vec![])
            .with_attr("start", Object::from(constant("start", 1)))
            .into_ref();
        let unit = Namespace::new("time")
            .with("sleep", constant("sleep", 1))
            .with("Timer", Arc::clone(&timer))
            .into_ref();

        engine.patch_unit(&unit, false).unwrap();
        assert!(unit.get("sleep").unwrap().same(&Object::from(replacement)));
        assert_eq!(timer.attr("start").unwrap().call(&[]).unwrap(), Value::Int(9));

        engine.uninstall();
        assert_eq!(unit.get("sleep").unwrap().call(&[]).unwrap(), Value::Int(1));
        assert_eq!(timer.attr("start").unwrap().call(&[]).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_type_attributes_recurse() {
        let nested = UnitSpec::new()
            .with_names(Directive::Proxy, ["send"])
            .with_names(Directive::Disable, ["fileno"]);
        let spec = PatchSpec::new().with_unit(
            "socket",
            UnitSpec::new().with(
                Directive::TypeAttributes,
                Targets::Nested(IndexMap::from([("Socket".to_string(), nested)])),
            ),
        );
        let (engine, host, _, _) = engine(spec);
        let ty = TypeDef::new("Socket", vec![])
            .with_attr("send", Object::from(constant("send", 1)))
            .with_attr("fileno", Object::from(constant("fileno", 4)))
            .into_ref();
        let unit = Namespace::new("socket").with("Socket", Arc::clone(&ty)).into_ref();

        engine.patch_unit(&unit, false).unwrap();
        assert_eq!(*host.proxied.lock(), vec!["socket.Socket.send".to_string()]);
        assert_eq!(engine.changes(), 2);
        engine.uninstall();
        assert_eq!(ty.attr("send").unwrap().call(&[]).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_update_refs_for_loaded_units() {
        let spec = PatchSpec::new().with_unit("os", UnitSpec::new().with_names(Directive::Proxy, ["getpid"]));
        let (engine, _, table, refs) = engine(spec);
        let original = Object::from(constant("getpid", 10));
        let unit = Namespace::new("os").with("getpid", original.clone()).into_ref();
        table.register(Arc::clone(&unit));

        let captured = Arc::new(ObjectList::new(vec![original.clone()]));
        refs.register(&(Arc::clone(&captured) as Arc<dyn Container>));

        assert_eq!(engine.patch_loaded().unwrap(), 1);
        let patched = unit.get("getpid").unwrap();
        assert!(captured.items()[0].same(&patched));

        engine.uninstall();
        assert!(captured.items()[0].same(&original));
        assert!(unit.get("getpid").unwrap().same(&original));
    }

    #[test]
    fn test_failure_names_unit_target_directive() {
        let spec = PatchSpec::new().with_unit("os", UnitSpec::new().with_names(Directive::PatchHash, ["getpid"]));
        let (engine, _, _, _) = engine(spec);
        let unit = Namespace::new("os").with("getpid", constant("getpid", 1)).into_ref();

        let err = engine.patch_unit(&unit, false).unwrap_err();
        let RetraceError::Configuration { reason } = &err else {
            panic!("unexpected error {:?}", err);
        };
        assert!(reason.contains("os.getpid"));
        assert!(reason.contains("unit os"));
        assert!(reason.contains("patch_hash"));
        assert!(reason.contains("expected a type"));
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn test_proxy_value_is_an_error() {
        let spec = PatchSpec::new().with_unit("sys", UnitSpec::new().with_names(Directive::Proxy, ["maxsize"]));
        let (engine, _, _, _) = engine(spec);
        let unit = Namespace::new("sys").with("maxsize", Value::Int(1)).into_ref();
        assert!(engine.patch_unit(&unit, false).is_err());
    }
}
