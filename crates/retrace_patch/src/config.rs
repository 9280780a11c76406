//! Layered patch configuration.
//!
//! Sources are scanned in order and the first registration of a unit name
//! wins, so a user directory placed before the built-in defaults overrides
//! them unit by unit.
//!
//! Two file layouts are accepted:
//!
//! ```toml
//! # grouped: every top-level table is a unit
//! [os]
//! proxy = ["read", "write"]
//! ```
//!
//! ```toml
//! # single unit (named after the file stem), with version sections
//! package = "grpcio"
//! proxy = ["Channel"]
//!
//! ["1.60"]
//! proxy = ["AioChannel"]
//! ```

use crate::directive::{Directive, PatchSpec, Targets, UnitSpec};
use retrace_core::{RetraceError, RetraceResult, Version};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default user configuration directory, relative to the working directory
pub const DEFAULT_USER_DIR: &str = ".retrace/modules";

const BUILTIN: &[(&str, &str)] = &[("stdlib", include_str!("../defaults/stdlib.toml"))];

/// Reports installed package versions
pub trait VersionProbe: Send + Sync {
    /// Installed version of `package`, `None` if not installed
    fn installed(&self, package: &str) -> Option<Version>;
}

/// Fixed table of installed versions
#[derive(Debug, Clone, Default)]
pub struct StaticVersions {
    versions: HashMap<String, Version>,
}

impl StaticVersions {
    /// Nothing installed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a package as installed
    #[must_use]
    pub fn with(mut self, package: impl Into<String>, version: Version) -> Self {
        self.versions.insert(package.into(), version);
        self
    }
}

impl VersionProbe for StaticVersions {
    fn installed(&self, package: &str) -> Option<Version> {
        self.versions.get(package).cloned()
    }
}

/// Where configuration files come from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Every `*.toml` file of a directory, in name order
    Directory(PathBuf),
    /// In-memory file
    Embedded {
        /// File stem
        name: String,
        /// TOML text
        text: String,
    },
}

impl ConfigSource {
    /// The configuration shipped with the runtime
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        BUILTIN
            .iter()
            .map(|(name, text)| Self::Embedded {
                name: (*name).to_string(),
                text: (*text).to_string(),
            })
            .collect()
    }
}

/// Resolves configuration sources into a [`PatchSpec`]
#[derive(Clone)]
pub struct ConfigResolver {
    sources: Vec<ConfigSource>,
    probe: Arc<dyn VersionProbe>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver with no sources and no installed packages
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            probe: Arc::new(StaticVersions::new()),
        }
    }

    /// User directory (if it exists) layered over the built-in defaults
    #[must_use]
    pub fn standard(user_dir: Option<&Path>) -> Self {
        let user_dir = user_dir.unwrap_or_else(|| Path::new(DEFAULT_USER_DIR));
        let mut resolver = Self::new();
        if user_dir.is_dir() {
            resolver = resolver.with_source(ConfigSource::Directory(user_dir.to_path_buf()));
        }
        resolver.with_builtin()
    }

    /// Append a source; earlier sources take precedence
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Append the built-in defaults
    #[must_use]
    pub fn with_builtin(mut self) -> Self {
        self.sources.extend(ConfigSource::builtin());
        self
    }

    /// Use `probe` for version-qualified sections
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn VersionProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Read every source
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unreadable files, invalid TOML,
    /// unknown directives or malformed version keys
    pub fn resolve(&self) -> RetraceResult<PatchSpec> {
        let mut spec = PatchSpec::new();
        for source in &self.sources {
            match source {
                ConfigSource::Directory(dir) => {
                    for path in toml_files(dir)? {
                        let text = std::fs::read_to_string(&path).map_err(|e| {
                            RetraceError::configuration(format!("cannot read {}: {}", path.display(), e))
                        })?;
                        let stem = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        self.process_file(&stem, &text, &mut spec)
                            .map_err(|e| in_file(&path.display().to_string(), e))?;
                    }
                }
                ConfigSource::Embedded { name, text } => {
                    self.process_file(name, text, &mut spec)
                        .map_err(|e| in_file(name, e))?;
                }
            }
        }
        tracing::debug!(units = spec.len(), sources = self.sources.len(), "patch configuration resolved");
        Ok(spec)
    }

    fn process_file(&self, stem: &str, text: &str, spec: &mut PatchSpec) -> RetraceResult<()> {
        let raw: toml::Table =
            toml::from_str(text).map_err(|e| RetraceError::configuration(e.to_string()))?;

        if raw.values().all(toml::Value::is_table) {
            for (unit, directives) in &raw {
                if let Some(table) = directives.as_table() {
                    spec.register(unit.clone(), UnitSpec::from_table(table)?);
                }
            }
            return Ok(());
        }

        if let Some(unit) = self.resolve_versioned(stem, raw)? {
            spec.register(stem, unit);
        }
        Ok(())
    }

    fn resolve_versioned(&self, stem: &str, mut raw: toml::Table) -> RetraceResult<Option<UnitSpec>> {
        let installed = match raw.remove("package") {
            Some(package) => {
                let package = package
                    .as_str()
                    .ok_or_else(|| RetraceError::configuration("package must be a string"))?;
                match self.probe.installed(package) {
                    Some(version) => Some(version),
                    None => {
                        tracing::warn!(unit = stem, package, "package not installed, configuration skipped");
                        return Ok(None);
                    }
                }
            }
            None => None,
        };

        let mut base = UnitSpec::new();
        let mut sections = Vec::new();
        for (key, value) in &raw {
            if Directive::is_directive(key) {
                let directive: Directive = key.parse()?;
                base.add(directive, Targets::from_toml(directive, value)?);
            } else if let Some(table) = value.as_table() {
                let version = Version::parse(key).map_err(|e| {
                    RetraceError::configuration(format!("bad version section {:?}: {}", key, e))
                })?;
                sections.push((version, UnitSpec::from_table(table)?));
            } else {
                return Err(RetraceError::configuration(format!("unknown directive: {}", key)));
            }
        }

        if let Some(installed) = installed {
            sections.sort_by(|a, b| a.0.cmp(&b.0));
            for (version, section) in sections.iter().filter(|(v, _)| installed >= *v) {
                tracing::trace!(unit = stem, %version, "version section applied");
                base.merge(section);
            }
        }
        Ok(Some(base))
    }
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

fn toml_files(dir: &Path) -> RetraceResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| RetraceError::configuration(format!("cannot read {}: {}", dir.display(), e)))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();
    Ok(files)
}

fn in_file(file: &str, err: RetraceError) -> RetraceError {
    match err {
        RetraceError::Configuration { reason } => {
            RetraceError::configuration(format!("{}: {}", file, reason))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(spec: &PatchSpec, unit: &str, directive: Directive) -> Vec<String> {
        match spec.unit(unit).and_then(|u| u.get(directive)) {
            Some(Targets::Names(n)) => n.clone(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_builtin_defaults_parse() {
        let spec = ConfigResolver::new().with_builtin().resolve().unwrap();
        assert!(spec.contains("time"));
        assert!(names(&spec, "os", Directive::Proxy).contains(&"getpid".to_string()));
        assert!(spec.unit("socket").unwrap().get(Directive::TypeAttributes).is_some());
    }

    #[test]
    fn test_user_directory_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), "[time]\nproxy = [\"sleep\"]\n").unwrap();

        let spec = ConfigResolver::standard(Some(dir.path())).resolve().unwrap();
        assert_eq!(names(&spec, "time", Directive::Proxy), vec!["sleep".to_string()]);
        assert!(spec.contains("os"));
    }

    #[test]
    fn test_files_read_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.toml"), "[app]\nproxy = [\"b\"]\n").unwrap();
        std::fs::write(dir.path().join("a.toml"), "[app]\nproxy = [\"a\"]\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let spec = ConfigResolver::new()
            .with_source(ConfigSource::Directory(dir.path().to_path_buf()))
            .resolve()
            .unwrap();
        assert_eq!(names(&spec, "app", Directive::Proxy), vec!["a".to_string()]);
    }

    #[test]
    fn test_single_unit_version_sections() {
        let text = r#"
            package = "grpcio"
            proxy = ["Channel"]

            ["1.70"]
            proxy = ["Later"]

            ["1.50"]
            proxy = ["Server"]
            disable = ["debug"]
        "#;
        let source = ConfigSource::Embedded {
            name: "grpc.cygrpc".to_string(),
            text: text.to_string(),
        };

        let probe = StaticVersions::new().with("grpcio", Version::parse("1.60.1").unwrap());
        let spec = ConfigResolver::new()
            .with_source(source.clone())
            .with_probe(Arc::new(probe))
            .resolve()
            .unwrap();
        assert_eq!(
            names(&spec, "grpc.cygrpc", Directive::Proxy),
            vec!["Channel".to_string(), "Server".to_string()]
        );
        assert_eq!(names(&spec, "grpc.cygrpc", Directive::Disable), vec!["debug".to_string()]);

        let newer = StaticVersions::new().with("grpcio", Version::parse("2.0").unwrap());
        let spec = ConfigResolver::new()
            .with_source(source.clone())
            .with_probe(Arc::new(newer))
            .resolve()
            .unwrap();
        assert_eq!(
            names(&spec, "grpc.cygrpc", Directive::Proxy),
            vec!["Channel".to_string(), "Server".to_string(), "Later".to_string()]
        );

        let spec = ConfigResolver::new().with_source(source).resolve().unwrap();
        assert!(!spec.contains("grpc.cygrpc"));
    }

    #[test]
    fn test_single_unit_without_package_ignores_sections() {
        let text = "proxy = [\"a\"]\n[\"1.0\"]\nproxy = [\"b\"]\n";
        let spec = ConfigResolver::new()
            .with_source(ConfigSource::Embedded {
                name: "lib".to_string(),
                text: text.to_string(),
            })
            .resolve()
            .unwrap();
        assert_eq!(names(&spec, "lib", Directive::Proxy), vec!["a".to_string()]);
    }

    #[test]
    fn test_errors_name_the_file() {
        let bad = |text: &str| {
            ConfigResolver::new()
                .with_source(ConfigSource::Embedded {
                    name: "broken".to_string(),
                    text: text.to_string(),
                })
                .resolve()
                .unwrap_err()
        };
        for err in [
            bad("[os]\npatch_types = [\"x\"]\n"),
            bad("proxy = [\"a\"]\nfrobnicate = 1\n"),
            bad("proxy = [\"a\"]\n[beta]\nproxy = [\"b\"]\n"),
            bad("not toml ["),
        ] {
            match err {
                RetraceError::Configuration { reason } => assert!(reason.starts_with("broken:"), "{}", reason),
                other => panic!("unexpected error {:?}", other),
            }
        }
    }
}
