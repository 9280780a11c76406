//! Recording header.
//!
//! The header is the first frame of a recording. It snapshots the
//! environment the recording was made in and is validated before any event
//! is consumed on replay.

use crate::encoding::CanonicalEncode;
use chrono::{DateTime, Utc};
use retrace_core::{
    Checksum, ProcessKey, RUNTIME_VERSION, RecordingId, RetraceError, RetraceResult,
    diff_checksums,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Options a recording was made with
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordingOptions {
    /// Call inputs were written alongside results
    pub trace_inputs: bool,
    /// Interception stayed active during shutdown
    pub trace_shutdown: bool,
    /// Stacks were captured for each guarded call
    pub stacktraces: bool,
    /// Call/return trace events were written
    pub trace_calls: bool,
    /// Monitoring level (0 = off)
    pub monitor: u8,
}

/// Environment snapshot written at the start of a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingHeader {
    /// Unique recording id
    pub id: RecordingId,
    /// When recording started
    pub recorded_at: DateTime<Utc>,
    /// Program arguments
    pub argv: Vec<String>,
    /// Path of the recorded executable
    pub executable: String,
    /// Working directory
    pub cwd: String,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Runtime version that wrote the recording
    pub runtime_version: String,
    /// Checksum per code unit
    pub checksums: BTreeMap<String, Checksum>,
    /// Process that started the recording
    pub process: ProcessKey,
    /// What was captured besides outcomes
    pub options: RecordingOptions,
}

impl CanonicalEncode for RecordingHeader {}

impl RecordingHeader {
    /// Snapshot the calling process
    ///
    /// # Errors
    ///
    /// Returns error if the working directory or executable path cannot be
    /// determined
    pub fn capture(argv: Vec<String>, checksums: BTreeMap<String, Checksum>) -> RetraceResult<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| RetraceError::record(format!("cannot read working directory: {}", e)))?;
        let executable = std::env::current_exe()
            .map_err(|e| RetraceError::record(format!("cannot locate executable: {}", e)))?;
        Ok(Self {
            id: RecordingId::new(),
            recorded_at: Utc::now(),
            argv,
            executable: executable.to_string_lossy().into_owned(),
            cwd: cwd.to_string_lossy().into_owned(),
            env: std::env::vars().collect(),
            runtime_version: RUNTIME_VERSION.to_string(),
            checksums,
            process: ProcessKey::current(),
            options: RecordingOptions::default(),
        })
    }

    /// Set recording options
    #[must_use]
    pub fn with_options(mut self, options: RecordingOptions) -> Self {
        self.options = options;
        self
    }

    /// Check that this recording can be replayed by `current`. Checksums
    /// are compared first, then the runtime version, then the executable.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::VersionMismatch`] if code units or the
    /// runtime version differ, and [`RetraceError::Configuration`] if the
    /// executable differs
    pub fn validate(&self, current: &RuntimeFingerprint) -> RetraceResult<()> {
        let diff = diff_checksums(&self.checksums, &current.checksums);
        if !diff.is_empty() {
            return Err(RetraceError::version_mismatch(format!(
                "code units changed since recording:\n  {}",
                diff.join("\n  ")
            )));
        }
        if self.runtime_version != current.runtime_version {
            return Err(RetraceError::version_mismatch(format!(
                "recorded with runtime {}, replaying with {}",
                self.runtime_version, current.runtime_version
            )));
        }
        if let Some(executable) = &current.executable {
            if *executable != self.executable {
                return Err(RetraceError::configuration(format!(
                    "recorded with executable {}, replaying with {}",
                    self.executable, executable
                )));
            }
        }
        Ok(())
    }

    /// Human readable dump
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> RetraceResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| RetraceError::record(e.to_string()))
    }
}

/// What the replaying process looks like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFingerprint {
    /// Runtime version of the replaying process
    pub runtime_version: String,
    /// `None` skips the executable check
    pub executable: Option<String>,
    /// Code-unit checksums of the replaying program
    pub checksums: BTreeMap<String, Checksum>,
}

impl RuntimeFingerprint {
    /// Fingerprint of this runtime with the given code-unit checksums
    #[must_use]
    pub fn current(checksums: BTreeMap<String, Checksum>) -> Self {
        Self {
            runtime_version: RUNTIME_VERSION.to_string(),
            executable: std::env::current_exe()
                .ok()
                .map(|p| p.to_string_lossy().into_owned()),
            checksums,
        }
    }

    /// Skip the executable check
    #[must_use]
    pub fn without_executable(mut self) -> Self {
        self.executable = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units() -> BTreeMap<String, Checksum> {
        let mut m = BTreeMap::new();
        m.insert("app.main".to_string(), Checksum::compute(b"fn main() {}"));
        m
    }

    #[test]
    fn test_capture() {
        let header = RecordingHeader::capture(vec!["prog".to_string()], units()).unwrap();
        assert_eq!(header.runtime_version, RUNTIME_VERSION);
        assert_eq!(header.process, ProcessKey::current());
        assert!(!header.cwd.is_empty());
    }

    #[test]
    fn test_validate_matching() {
        let header = RecordingHeader::capture(vec![], units()).unwrap();
        assert!(header.validate(&RuntimeFingerprint::current(units())).is_ok());
    }

    #[test]
    fn test_validate_checksum_mismatch() {
        let header = RecordingHeader::capture(vec![], units()).unwrap();
        let mut changed = units();
        changed.insert("app.main".to_string(), Checksum::compute(b"fn main() { x() }"));
        let err = header
            .validate(&RuntimeFingerprint::current(changed))
            .unwrap_err();
        match err {
            RetraceError::VersionMismatch { reason } => assert!(reason.contains("app.main: changed")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_runtime_version() {
        let mut header = RecordingHeader::capture(vec![], units()).unwrap();
        header.runtime_version = "0.0.1-old".to_string();
        assert!(matches!(
            header.validate(&RuntimeFingerprint::current(units())),
            Err(RetraceError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_executable() {
        let mut header = RecordingHeader::capture(vec![], units()).unwrap();
        header.executable = "/usr/bin/other".to_string();
        let current = RuntimeFingerprint::current(units());
        assert!(matches!(
            header.validate(&current),
            Err(RetraceError::Configuration { .. })
        ));
        assert!(header.validate(&current.without_executable()).is_ok());
    }

    #[test]
    fn test_to_json() {
        let header = RecordingHeader::capture(vec!["a".to_string()], units()).unwrap();
        let json = header.to_json().unwrap();
        assert!(json.contains("\"argv\""));
        assert!(json.contains("app.main"));
    }
}
