//! Record and replay sessions.
//!
//! A session ties a [`System`] to a recording file: it writes or validates
//! the header, runs a [`Target`] inside the matching context and checks the
//! stream was consumed exactly.

use crate::fork::ForkPath;
use crate::system::System;
use retrace_core::{
    CallError, CallResult, Checksum, DivergenceKind, Raised, RetraceError, RetraceResult, Value, program_checksums,
};
use retrace_log::{
    ReaderConfig, RecordingFile, RecordingHeader, RecordingOptions, RuntimeFingerprint, WriterConfig,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a target returned, or the exception it raised
pub type Outcome = Result<Value, Raised>;

/// Separate program outcomes from system failures
///
/// # Errors
///
/// Returns the system failure if the call failed for a reason other than a
/// raised exception
pub fn split(result: CallResult) -> RetraceResult<Outcome> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(CallError::Raised(raised)) => Ok(Err(raised)),
        Err(CallError::Retrace(err)) => Err(err),
    }
}

/// Checksums for a session header: `explicit` when given, otherwise the
/// running executable plus the files under `source_root`
fn resolve_checksums(
    explicit: Option<&BTreeMap<String, Checksum>>,
    source_root: Option<&Path>,
) -> RetraceResult<BTreeMap<String, Checksum>> {
    match explicit {
        Some(checksums) => Ok(checksums.clone()),
        None => program_checksums(source_root)
            .map_err(|e| RetraceError::record(format!("cannot checksum program: {}", e))),
    }
}

/// Program run under a session
pub trait Target {
    /// Run once with `system` installed and a context active
    fn run(&mut self, system: &System) -> CallResult;
}

impl<F> Target for F
where
    F: FnMut(&System) -> CallResult,
{
    fn run(&mut self, system: &System) -> CallResult {
        self(system)
    }
}

/// Records one run of a target to a file
#[derive(Debug, Clone)]
pub struct RecordSession {
    path: PathBuf,
    argv: Vec<String>,
    checksums: Option<BTreeMap<String, Checksum>>,
    source_root: Option<PathBuf>,
    options: RecordingOptions,
    writer: WriterConfig,
}

impl RecordSession {
    /// Session recording to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            argv: std::env::args().collect(),
            checksums: None,
            source_root: None,
            options: RecordingOptions::default(),
            writer: WriterConfig::default(),
        }
    }

    /// Arguments stored in the header
    #[must_use]
    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    /// Code-unit checksums stored in the header, replacing the checksums
    /// of the running program
    #[must_use]
    pub fn with_checksums(mut self, checksums: BTreeMap<String, Checksum>) -> Self {
        self.checksums = Some(checksums);
        self
    }

    /// Also checksum every file under `root`
    #[must_use]
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    /// What to capture besides outcomes
    #[must_use]
    pub fn with_options(mut self, options: RecordingOptions) -> Self {
        self.options = options;
        self
    }

    /// Writer queue configuration
    #[must_use]
    pub fn with_writer_config(mut self, config: WriterConfig) -> Self {
        self.writer = config;
        self
    }

    /// Write the header, then run `target` in a record context. The
    /// recording is closed even when the target fails.
    ///
    /// # Errors
    ///
    /// Returns error if the recording cannot be written or the target
    /// fails for a reason other than a raised exception
    pub fn run(&self, system: &System, mut target: impl Target) -> RetraceResult<Outcome> {
        let checksums = resolve_checksums(self.checksums.as_ref(), self.source_root.as_deref())?;
        let header = RecordingHeader::capture(self.argv.clone(), checksums)?.with_options(self.options.clone());
        let recording = RecordingFile::create(&self.path, header)?;
        let writer = Arc::new(recording.writer(self.writer.clone())?);
        tracing::info!(path = %self.path.display(), "recording");

        let result = {
            let scope = system.record_context_with(Arc::clone(&writer), self.options.clone());
            let _guard = scope.enter();
            target.run(system)
        };
        writer.close()?;
        let stats = writer.stats();
        tracing::debug!(written = stats.written, dropped = stats.dropped, "recording closed");
        split(result)
    }
}

/// Replays a recording file against a target
#[derive(Debug)]
pub struct ReplaySession {
    path: PathBuf,
    checksums: Option<BTreeMap<String, Checksum>>,
    source_root: Option<PathBuf>,
    fingerprint: Option<RuntimeFingerprint>,
    fork_path: String,
}

impl ReplaySession {
    /// Session replaying the recording at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            checksums: None,
            source_root: None,
            fingerprint: None,
            fork_path: String::new(),
        }
    }

    /// Code-unit checksums of the replaying program, replacing the
    /// checksums of the running program
    #[must_use]
    pub fn with_checksums(mut self, checksums: BTreeMap<String, Checksum>) -> Self {
        self.checksums = Some(checksums);
        self
    }

    /// Also checksum every file under `root`
    #[must_use]
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    /// Validate the header against `fingerprint` instead of this runtime
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: RuntimeFingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Fork path descriptor to follow at duplication points
    #[must_use]
    pub fn with_fork_path(mut self, descriptor: impl Into<String>) -> Self {
        self.fork_path = descriptor.into();
        self
    }

    /// Validate the recording, then run `target` in a replay context
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::RecordingNotFound`](retrace_core::RetraceError::RecordingNotFound)
    /// for a missing file, a version or configuration error if the header
    /// does not match, and a divergence if the replay departs from the
    /// recording or leaves events unconsumed
    pub fn run(&self, system: &System, mut target: impl Target) -> RetraceResult<Outcome> {
        let fork_path = ForkPath::parse(&self.fork_path)?;
        let recording = RecordingFile::open(&self.path)?;
        let header = recording.header();
        let fingerprint = match &self.fingerprint {
            Some(fingerprint) => fingerprint.clone(),
            None => RuntimeFingerprint::current(resolve_checksums(
                self.checksums.as_ref(),
                self.source_root.as_deref(),
            )?),
        };
        header.validate(&fingerprint)?;

        let config = ReaderConfig::default().with_monitor(header.options.monitor > 0);
        let reader = Arc::new(recording.reader(config)?);
        tracing::info!(path = %self.path.display(), id = %header.id, %fork_path, "replaying");

        let result = {
            let scope = system.replay_context_with(Arc::clone(&reader), header.options.clone(), fork_path);
            let _guard = scope.enter();
            target.run(system)
        };
        let outcome = split(result)?;
        let remaining = reader.unconsumed()?;
        if remaining > 0 {
            return Err(reader.divergence(
                DivergenceKind::Unconsumed,
                format!("{} recorded events were not replayed", remaining),
            ));
        }
        Ok(outcome)
    }
}
