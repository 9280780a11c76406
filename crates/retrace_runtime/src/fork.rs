//! Process duplication.
//!
//! Recording lets every fork through: both processes keep running and the
//! child appends its own events, tagged with its pid, to the same file.
//! Replay never forks. A [`ForkPath`] picks, at each duplication point,
//! whether to continue as the parent or as the child.

use crate::context::Mode;
use crate::system::System;
use retrace_core::{
    CallError, CallResult, DispatchState, Divergence, DivergenceKind, ProcessKey, RetraceError,
    RetraceResult, Value,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of child steps the bare `child` descriptor expands to
pub const CHILD_DEPTH: usize = 1000;

/// Which side of a fork the caller continues on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// The original process
    Parent {
        /// Pid of the new process
        child: ProcessKey,
    },
    /// The new process
    Child,
}

impl ForkOutcome {
    /// Whether this is the child side
    #[must_use]
    pub const fn is_child(&self) -> bool {
        matches!(self, Self::Child)
    }

    /// Value a guarded fork returns: the child pid in the parent, 0 in the
    /// child
    #[must_use]
    pub const fn pid(&self) -> u32 {
        match self {
            Self::Parent { child } => child.0,
            Self::Child => 0,
        }
    }
}

/// Real process duplication
pub trait Forker: Send + Sync {
    /// Duplicate the calling process
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be duplicated
    fn fork(&self) -> RetraceResult<ForkOutcome>;
}

/// [`Forker`] backed by `fork(2)`
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsForker;

#[cfg(unix)]
impl Forker for OsForker {
    fn fork(&self) -> RetraceResult<ForkOutcome> {
        // SAFETY: the child only re-opens its writer and continues on the
        // forking thread.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(RetraceError::record(format!(
                "fork failed: {}",
                std::io::Error::last_os_error()
            ))),
            0 => Ok(ForkOutcome::Child),
            pid => Ok(ForkOutcome::Parent {
                child: ProcessKey(pid.unsigned_abs()),
            }),
        }
    }
}

/// Sequence of parent (0) / child (1) choices consumed during replay
#[derive(Debug, Default)]
pub struct ForkPath {
    bits: Vec<bool>,
    next: AtomicUsize,
}

impl ForkPath {
    /// A path that always stays in the parent
    #[must_use]
    pub fn parent() -> Self {
        Self::default()
    }

    /// Expand a descriptor into a string of `0`s and `1`s.
    ///
    /// Accepts raw bits (`1101`), the keywords `child` and `parent`, and
    /// run-length forms starting with either keyword (`child-2-1-1` is
    /// `1101`, `parent-3-2` is `00011`).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown keyword or a malformed
    /// run length
    pub fn decode(descriptor: &str) -> RetraceResult<String> {
        let descriptor = descriptor.trim();
        match descriptor {
            "" | "parent" => return Ok(String::new()),
            "child" => return Ok("1".repeat(CHILD_DEPTH)),
            bits if bits.chars().all(|c| c == '0' || c == '1') => return Ok(bits.to_string()),
            _ => {}
        }

        let mut parts = descriptor.split('-');
        let mut bit = match parts.next() {
            Some("child") => '1',
            Some("parent") => '0',
            _ => {
                return Err(RetraceError::configuration(format!(
                    "invalid fork path: {}",
                    descriptor
                )));
            }
        };
        let mut decoded = String::new();
        for run in parts {
            let count: usize = run.parse().map_err(|_| {
                RetraceError::configuration(format!(
                    "invalid run length {:?} in fork path {}",
                    run, descriptor
                ))
            })?;
            decoded.extend(std::iter::repeat_n(bit, count));
            bit = if bit == '1' { '0' } else { '1' };
        }
        Ok(decoded)
    }

    /// Parse a descriptor
    ///
    /// # Errors
    ///
    /// See [`decode`](Self::decode)
    pub fn parse(descriptor: &str) -> RetraceResult<Self> {
        let bits = Self::decode(descriptor)?.chars().map(|c| c == '1').collect();
        Ok(Self {
            bits,
            next: AtomicUsize::new(0),
        })
    }

    /// Choice for the next duplication point; parent once exhausted
    pub fn next_bit(&self) -> bool {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Duplication points reached so far
    #[must_use]
    pub fn position(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Number of explicit choices
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the path stays in the parent everywhere
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

impl fmt::Display for ForkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in &self.bits {
            f.write_str(if *bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl System {
    /// Duplicate the process at a recorded duplication point.
    ///
    /// Outside a context this is `forker.fork()`. While recording, the
    /// writer is drained first and the child re-opens it under its own pid;
    /// each side records the value it observed. On replay nothing forks:
    /// the recorded child pid is read back and the next fork path choice
    /// decides which process's events to follow.
    ///
    /// # Errors
    ///
    /// Returns error if the fork fails, the writer cannot be drained or
    /// re-opened, or the recording has no fork outcome here
    pub fn fork(&self, forker: &dyn Forker) -> RetraceResult<ForkOutcome> {
        let Some(ctx) = self.core.active() else {
            return forker.fork();
        };
        match ctx.mode() {
            Mode::Record { writer, .. } => {
                writer.flush()?;
                let outcome = self
                    .core
                    .state
                    .scoped(DispatchState::Internal, || forker.fork())?;
                if outcome.is_child() {
                    writer.reopen_after_fork(ProcessKey::current())?;
                }
                writer.write_result(Value::Int(i64::from(outcome.pid())))?;
                tracing::debug!(?outcome, "fork recorded");
                Ok(outcome)
            }
            Mode::Replay {
                reader, fork_path, ..
            } => {
                let child = replayed_pid(reader.read_result())?;
                if !fork_path.next_bit() {
                    tracing::debug!(%child, "replay continues in parent");
                    return Ok(ForkOutcome::Parent { child });
                }
                reader.switch_process(child);
                let own = replayed_pid(reader.read_result())?;
                if own.0 != 0 {
                    return Err(RetraceError::divergence(Divergence::new(
                        DivergenceKind::Structure,
                        format!("child of fork observed pid {}, expected 0", own),
                    )));
                }
                tracing::debug!(%child, "replay follows child");
                Ok(ForkOutcome::Child)
            }
        }
    }
}

fn replayed_pid(result: CallResult) -> RetraceResult<ProcessKey> {
    match result {
        Ok(Value::Int(pid)) => u32::try_from(pid)
            .map(ProcessKey)
            .map_err(|_| RetraceError::replay(format!("recorded fork result {} is not a pid", pid))),
        Ok(other) => Err(RetraceError::replay(format!(
            "recorded fork result {} is not a pid",
            other
        ))),
        Err(CallError::Raised(raised)) => Err(RetraceError::replay(format!(
            "recorded fork raised {}",
            raised
        ))),
        Err(CallError::Retrace(err)) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SystemConfig;
    use proptest::prelude::*;
    use retrace_core::ThreadKey;
    use retrace_log::{ReaderConfig, RecordingOptions, StreamReader, StreamWriter, WriterConfig};
    use retrace_patch::PatchSpec;
    use std::sync::Arc;

    struct Scripted(ForkOutcome);

    impl Forker for Scripted {
        fn fork(&self) -> RetraceResult<ForkOutcome> {
            Ok(self.0)
        }
    }

    struct Unreachable;

    impl Forker for Unreachable {
        fn fork(&self) -> RetraceResult<ForkOutcome> {
            panic!("replay must not fork")
        }
    }

    #[test]
    fn test_decode_keywords() {
        assert_eq!(ForkPath::decode("child").unwrap(), "1".repeat(CHILD_DEPTH));
        assert_eq!(ForkPath::decode("parent").unwrap(), "");
        assert_eq!(ForkPath::decode("").unwrap(), "");
    }

    #[test]
    fn test_decode_bits_and_runs() {
        assert_eq!(ForkPath::decode("1101").unwrap(), "1101");
        assert_eq!(ForkPath::decode("0000").unwrap(), "0000");
        assert_eq!(ForkPath::decode("child-2-1-1").unwrap(), "1101");
        assert_eq!(ForkPath::decode("parent-3-2").unwrap(), "00011");
        assert_eq!(ForkPath::decode("child-5").unwrap(), "11111");
    }

    #[test]
    fn test_decode_malformed() {
        for bad in ["child-x", "child--1", "sibling-1", "12"] {
            let err = ForkPath::decode(bad).unwrap_err();
            assert!(matches!(err, RetraceError::Configuration { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_next_bit_defaults_to_parent() {
        let path = ForkPath::parse("10").unwrap();
        assert!(path.next_bit());
        assert!(!path.next_bit());
        assert!(!path.next_bit());
        assert_eq!(path.position(), 3);
        assert_eq!(path.to_string(), "10");
    }

    #[test]
    fn test_outcome_pid() {
        let parent = ForkOutcome::Parent {
            child: ProcessKey(42),
        };
        assert_eq!(parent.pid(), 42);
        assert!(!parent.is_child());
        assert_eq!(ForkOutcome::Child.pid(), 0);
    }

    #[test]
    fn test_fork_without_context_delegates() {
        let system = System::new(PatchSpec::new(), SystemConfig::default());
        let outcome = system.fork(&Scripted(ForkOutcome::Child)).unwrap();
        assert_eq!(outcome, ForkOutcome::Child);
    }

    #[test]
    fn test_fork_replay_follows_path() {
        let _id = ThreadKey::root().enter();
        let system = System::new(PatchSpec::new(), SystemConfig::default());
        let (writer, buffer) = StreamWriter::memory(WriterConfig::default()).unwrap();
        let writer = Arc::new(writer);
        let child = ProcessKey(7);
        {
            let _g = system.record_context(Arc::clone(&writer), false).enter();
            let outcome = system.fork(&Scripted(ForkOutcome::Parent { child })).unwrap();
            assert_eq!(outcome.pid(), 7);
            system.checkpoint("parent").unwrap();
        }
        // what the child process appends after re-opening
        writer.flush().unwrap();
        writer.reopen_after_fork(child).unwrap();
        writer.write_result(Value::Int(0)).unwrap();
        writer.checkpoint("child").unwrap();
        writer.close().unwrap();
        let bytes = buffer.snapshot();

        let replay = |path: &str| {
            let reader = Arc::new(StreamReader::from_bytes(
                bytes.clone(),
                ProcessKey::current(),
                ReaderConfig::default(),
            ));
            let scope = system.replay_context_with(
                reader,
                RecordingOptions::default(),
                ForkPath::parse(path).unwrap(),
            );
            let _g = scope.enter();
            let outcome = system.fork(&Unreachable).unwrap();
            let label = if outcome.is_child() { "child" } else { "parent" };
            system.checkpoint(label).unwrap();
            outcome
        };
        assert_eq!(replay("0"), ForkOutcome::Parent { child });
        assert_eq!(replay("parent"), ForkOutcome::Parent { child });
        assert_eq!(replay("child"), ForkOutcome::Child);
    }

    proptest! {
        #[test]
        fn prop_runs_sum_to_length(runs in proptest::collection::vec(0usize..6, 1..6)) {
            let descriptor = format!(
                "child-{}",
                runs.iter().map(ToString::to_string).collect::<Vec<_>>().join("-")
            );
            let decoded = ForkPath::decode(&descriptor).unwrap();
            prop_assert_eq!(decoded.len(), runs.iter().sum::<usize>());
        }
    }
}
