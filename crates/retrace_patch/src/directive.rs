//! Patch directives and the resolved patch specification.

use indexmap::IndexMap;
use retrace_core::{RetraceError, RetraceResult};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A patch directive. Variants are declared in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Directive {
    /// Add named types to the immutable type set
    Immutable,
    /// Pre-register objects for cross-run identity
    Bind,
    /// Route a type's hash through the deterministic hasher
    PatchHash,
    /// Always bypass interception
    Disable,
    /// Substitute with an alternate resolved by qualified name
    Wrap,
    /// Substitute attributes of a type
    PatchClass,
    /// Apply directives to a type's attribute table
    TypeAttributes,
    /// Route callables through the dispatch core
    Proxy,
}

impl Directive {
    /// Every directive in application order
    pub const ORDER: [Self; 8] = [
        Self::Immutable,
        Self::Bind,
        Self::PatchHash,
        Self::Disable,
        Self::Wrap,
        Self::PatchClass,
        Self::TypeAttributes,
        Self::Proxy,
    ];

    /// Configuration key
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immutable => "immutable",
            Self::Bind => "bind",
            Self::PatchHash => "patch_hash",
            Self::Disable => "disable",
            Self::Wrap => "wrap",
            Self::PatchClass => "patch_class",
            Self::TypeAttributes => "type_attributes",
            Self::Proxy => "proxy",
        }
    }

    /// Whether `key` names a directive
    #[must_use]
    pub fn is_directive(key: &str) -> bool {
        Self::ORDER.iter().any(|d| d.as_str() == key)
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Directive {
    type Err = RetraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| RetraceError::configuration(format!("unknown directive: {}", s)))
    }
}

/// Targets of one directive
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    /// Plain list of names
    Names(Vec<String>),
    /// Name to qualified alternate (`wrap`)
    Alternates(IndexMap<String, String>),
    /// Type name to attribute alternates (`patch_class`)
    ClassAlternates(IndexMap<String, IndexMap<String, String>>),
    /// Type name to directives for its attributes (`type_attributes`)
    Nested(IndexMap<String, UnitSpec>),
}

/// One target and its argument
#[derive(Debug, Clone, Copy)]
pub enum TargetArg<'a> {
    /// No argument
    None,
    /// Qualified name of an alternate
    Path(&'a str),
    /// Attribute to qualified alternate
    Attributes(&'a IndexMap<String, String>),
    /// Directives for a type's attributes
    Nested(&'a UnitSpec),
}

impl Targets {
    /// Empty targets of the shape `directive` expects
    #[must_use]
    pub fn empty(directive: Directive) -> Self {
        match directive {
            Directive::Wrap => Self::Alternates(IndexMap::new()),
            Directive::PatchClass => Self::ClassAlternates(IndexMap::new()),
            Directive::TypeAttributes => Self::Nested(IndexMap::new()),
            _ => Self::Names(Vec::new()),
        }
    }

    /// Target names and their arguments, in configuration order
    #[must_use]
    pub fn entries(&self) -> Vec<(&str, TargetArg<'_>)> {
        match self {
            Self::Names(names) => names.iter().map(|n| (n.as_str(), TargetArg::None)).collect(),
            Self::Alternates(map) => map
                .iter()
                .map(|(n, p)| (n.as_str(), TargetArg::Path(p)))
                .collect(),
            Self::ClassAlternates(map) => map
                .iter()
                .map(|(n, a)| (n.as_str(), TargetArg::Attributes(a)))
                .collect(),
            Self::Nested(map) => map
                .iter()
                .map(|(n, s)| (n.as_str(), TargetArg::Nested(s)))
                .collect(),
        }
    }

    /// Number of targets
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Names(v) => v.len(),
            Self::Alternates(m) => m.len(),
            Self::ClassAlternates(m) => m.len(),
            Self::Nested(m) => m.len(),
        }
    }

    /// Whether there are no targets
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `other`'s targets. Lists are concatenated; for mappings, names
    /// already present keep their existing entry, except nested directive
    /// sets which are merged recursively.
    pub fn merge(&mut self, other: &Self) {
        match (self, other) {
            (Self::Names(a), Self::Names(b)) => a.extend(b.iter().cloned()),
            (Self::Alternates(a), Self::Alternates(b)) => {
                for (k, v) in b {
                    a.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            (Self::ClassAlternates(a), Self::ClassAlternates(b)) => {
                for (k, v) in b {
                    let attrs = a.entry(k.clone()).or_default();
                    for (attr, path) in v {
                        attrs.entry(attr.clone()).or_insert_with(|| path.clone());
                    }
                }
            }
            (Self::Nested(a), Self::Nested(b)) => {
                for (k, v) in b {
                    a.entry(k.clone()).or_default().merge(v);
                }
            }
            _ => {}
        }
    }

    /// Parse the value of `directive` from configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the value has the wrong shape
    pub fn from_toml(directive: Directive, value: &toml::Value) -> RetraceResult<Self> {
        let shape = |expected: &str| {
            RetraceError::configuration(format!(
                "{} expects {}, found {}",
                directive,
                expected,
                value.type_str()
            ))
        };
        match directive {
            Directive::Wrap => {
                let table = value.as_table().ok_or_else(|| shape("a table"))?;
                Ok(Self::Alternates(string_table(directive, table)?))
            }
            Directive::PatchClass => {
                let table = value.as_table().ok_or_else(|| shape("a table"))?;
                let mut classes = IndexMap::new();
                for (ty, attrs) in table {
                    let attrs = attrs.as_table().ok_or_else(|| shape("a table of tables"))?;
                    classes.insert(ty.clone(), string_table(directive, attrs)?);
                }
                Ok(Self::ClassAlternates(classes))
            }
            Directive::TypeAttributes => {
                let table = value.as_table().ok_or_else(|| shape("a table"))?;
                let mut nested = IndexMap::new();
                for (ty, spec) in table {
                    let spec = spec.as_table().ok_or_else(|| shape("a table of tables"))?;
                    nested.insert(ty.clone(), UnitSpec::from_table(spec)?);
                }
                Ok(Self::Nested(nested))
            }
            _ => {
                let items = value.as_array().ok_or_else(|| shape("a list"))?;
                let names = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).ok_or_else(|| shape("a list of names")))
                    .collect::<RetraceResult<Vec<_>>>()?;
                Ok(Self::Names(names))
            }
        }
    }
}

fn string_table(directive: Directive, table: &toml::Table) -> RetraceResult<IndexMap<String, String>> {
    table
        .iter()
        .map(|(k, v)| {
            v.as_str().map(|s| (k.clone(), s.to_string())).ok_or_else(|| {
                RetraceError::configuration(format!("{}.{} must be a qualified name", directive, k))
            })
        })
        .collect()
}

/// Directives for one code unit (or one type's attribute table)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitSpec {
    directives: BTreeMap<Directive, Targets>,
}

impl UnitSpec {
    /// Create an empty spec
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add targets for a directive, merging with existing ones
    #[must_use]
    pub fn with(mut self, directive: Directive, targets: Targets) -> Self {
        self.add(directive, targets);
        self
    }

    /// Add plain names for a directive
    #[must_use]
    pub fn with_names<I, S>(self, directive: Directive, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(directive, Targets::Names(names.into_iter().map(Into::into).collect()))
    }

    /// Add targets for a directive, merging with existing ones
    pub fn add(&mut self, directive: Directive, targets: Targets) {
        match self.directives.get_mut(&directive) {
            Some(existing) => existing.merge(&targets),
            None => {
                self.directives.insert(directive, targets);
            }
        }
    }

    /// Targets of one directive
    #[must_use]
    pub fn get(&self, directive: Directive) -> Option<&Targets> {
        self.directives.get(&directive)
    }

    /// Directives in application order
    pub fn directives(&self) -> impl Iterator<Item = (Directive, &Targets)> {
        self.directives.iter().map(|(d, t)| (*d, t))
    }

    /// Whether no directive is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Merge `other` additively
    pub fn merge(&mut self, other: &Self) {
        for (directive, targets) in &other.directives {
            self.add(*directive, targets.clone());
        }
    }

    /// Parse a table whose every key is a directive
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown directives or malformed
    /// targets
    pub fn from_table(table: &toml::Table) -> RetraceResult<Self> {
        let mut spec = Self::new();
        for (key, value) in table {
            let directive: Directive = key.parse()?;
            spec.add(directive, Targets::from_toml(directive, value)?);
        }
        Ok(spec)
    }
}

/// Resolved patch configuration: unit name to directives
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSpec {
    units: IndexMap<String, UnitSpec>,
}

impl PatchSpec {
    /// Create an empty specification
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit; the first registration of a name wins
    pub fn register(&mut self, unit: impl Into<String>, spec: UnitSpec) -> bool {
        let unit = unit.into();
        if self.units.contains_key(&unit) {
            tracing::trace!(unit = %unit, "unit already configured");
            return false;
        }
        self.units.insert(unit, spec);
        true
    }

    /// Builder form of [`PatchSpec::register`]
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>, spec: UnitSpec) -> Self {
        self.register(unit, spec);
        self
    }

    /// Directives for a unit
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&UnitSpec> {
        self.units.get(name)
    }

    /// Whether a unit is configured
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Configured unit names in registration order
    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Number of configured units
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether nothing is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
