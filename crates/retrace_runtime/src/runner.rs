//! In-process record/replay harness.
//!
//! [`TestRunner`] records a closure into memory and replays it right away,
//! comparing what both runs returned. Useful for checking that a piece of
//! code replays deterministically without touching the filesystem.

use crate::fork::ForkPath;
use crate::session::{Outcome, Target, split};
use crate::system::System;
use retrace_core::{DivergenceKind, ProcessKey, RetraceError, RetraceResult};
use retrace_log::{ReaderConfig, RecordingOptions, StreamReader, StreamWriter, WriterConfig};
use retrace_replay::DivergenceReport;
use std::sync::Arc;

/// An in-memory recording and the outcome it captured
#[derive(Debug, Clone)]
pub struct Recording {
    bytes: Vec<u8>,
    outcome: Outcome,
    options: RecordingOptions,
}

impl Recording {
    /// Encoded event stream
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// What the recorded run returned
    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Options the recording was made with
    #[must_use]
    pub fn options(&self) -> &RecordingOptions {
        &self.options
    }
}

/// Result of [`TestRunner::diagnose`]
#[derive(Debug, Default)]
pub struct Diagnosis {
    /// First call trace difference, if any
    pub report: Option<DivergenceReport>,
    /// Error the replay stopped with
    pub error: Option<RetraceError>,
    /// Recorded and replayed outcomes, when both runs finished but differ
    pub mismatch: Option<(Outcome, Outcome)>,
}

impl Diagnosis {
    /// Whether the replay matched the recording
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.report.is_none() && self.error.is_none() && self.mismatch.is_none()
    }
}

/// Records and replays closures in memory
#[derive(Debug, Clone, Default)]
pub struct TestRunner {
    options: RecordingOptions,
    writer: WriterConfig,
}

impl TestRunner {
    /// Runner with default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// What to capture besides outcomes
    #[must_use]
    pub fn with_options(mut self, options: RecordingOptions) -> Self {
        self.options = options;
        self
    }

    /// Record one run of `target`
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be written or the target fails
    /// for a reason other than a raised exception
    pub fn record(&self, system: &System, mut target: impl Target) -> RetraceResult<Recording> {
        let (writer, buffer) = StreamWriter::memory(self.writer.clone())?;
        let writer = Arc::new(writer);
        let result = {
            let _guard = system
                .record_context_with(Arc::clone(&writer), self.options.clone())
                .enter();
            target.run(system)
        };
        writer.close()?;
        Ok(Recording {
            bytes: buffer.snapshot(),
            outcome: split(result)?,
            options: self.options.clone(),
        })
    }

    /// Replay `recording` against `target`. If both runs raised, the
    /// recorded exception is returned.
    ///
    /// # Errors
    ///
    /// Returns a divergence if exactly one run raised, if recorded events
    /// remain unconsumed, or if the return values differ
    pub fn replay(&self, system: &System, recording: &Recording, target: impl Target) -> RetraceResult<Outcome> {
        let Replayed { outcome, reader, .. } = self.replay_with(system, recording, target);
        let outcome = outcome?;
        let remaining = reader.unconsumed()?;
        match (&recording.outcome, &outcome) {
            (Ok(_), Err(raised)) => {
                return Err(reader.divergence(
                    DivergenceKind::Outcome,
                    format!("replay raised {} but the recording returned", raised),
                ));
            }
            (Err(raised), Ok(_)) => {
                return Err(reader.divergence(
                    DivergenceKind::Outcome,
                    format!("recording raised {} but the replay returned", raised),
                ));
            }
            _ => {}
        }
        if remaining > 0 {
            return Err(reader.divergence(
                DivergenceKind::Unconsumed,
                format!("{} recorded events were not replayed", remaining),
            ));
        }
        match (&recording.outcome, outcome) {
            (Ok(recorded), Ok(replayed)) if *recorded != replayed => Err(reader.divergence(
                DivergenceKind::Outcome,
                format!("recording returned {}, replay returned {}", recorded, replayed),
            )),
            (Err(raised), Err(_)) => Ok(Err(raised.clone())),
            (_, outcome) => Ok(outcome),
        }
    }

    /// Record `target`, then replay it
    ///
    /// # Errors
    ///
    /// See [`record`](Self::record) and [`replay`](Self::replay)
    pub fn run(&self, system: &System, mut target: impl Target) -> RetraceResult<Outcome> {
        let recording = self.record(system, |s: &System| target.run(s))?;
        self.replay(system, &recording, target)
    }

    /// Record and replay `target` with call tracing on, reporting where
    /// the two runs first part ways instead of failing
    pub fn diagnose(&self, system: &System, mut target: impl Target) -> Diagnosis {
        let runner = self.clone().with_options(RecordingOptions {
            trace_calls: true,
            ..self.options.clone()
        });
        let mut diagnosis = Diagnosis::default();
        let recording = match runner.record(system, |s: &System| target.run(s)) {
            Ok(recording) => recording,
            Err(err) => {
                diagnosis.error = Some(err);
                return diagnosis;
            }
        };
        let replayed = runner.replay_with(system, &recording, target);
        diagnosis.report = replayed.report;
        match replayed.outcome {
            Ok(outcome) if outcome != recording.outcome => {
                diagnosis.mismatch = Some((recording.outcome.clone(), outcome));
            }
            Ok(_) => match replayed.reader.unconsumed() {
                Ok(0) => {}
                Ok(remaining) => {
                    diagnosis.error = Some(replayed.reader.divergence(
                        DivergenceKind::Unconsumed,
                        format!("{} recorded events were not replayed", remaining),
                    ));
                }
                Err(err) => diagnosis.error = Some(err),
            },
            Err(err) => diagnosis.error = Some(err),
        }
        if !diagnosis.is_clean() {
            tracing::warn!(?diagnosis, "replay diverged");
        }
        diagnosis
    }

    fn replay_with(&self, system: &System, recording: &Recording, mut target: impl Target) -> Replayed {
        let config = ReaderConfig::default().with_monitor(recording.options.monitor > 0);
        let reader = Arc::new(StreamReader::from_bytes(
            recording.bytes.clone(),
            ProcessKey::current(),
            config,
        ));
        let scope = system.replay_context_with(
            Arc::clone(&reader),
            recording.options.clone(),
            ForkPath::parent(),
        );
        let result = {
            let _guard = scope.enter();
            target.run(system)
        };
        Replayed {
            outcome: split(result),
            report: scope.context().detector().and_then(|d| d.report()),
            reader,
        }
    }
}

struct Replayed {
    outcome: RetraceResult<Outcome>,
    reader: Arc<StreamReader>,
    report: Option<DivergenceReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SystemConfig;
    use retrace_core::{CallResult, Raised, ThreadKey, Value, func};
    use retrace_log::CallSite;
    use retrace_patch::{Directive, Function, Instance, Namespace, Object, PatchSpec, TypeDef, UnitSpec};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn system() -> (System, Arc<AtomicI64>) {
        let ticks = Arc::new(AtomicI64::new(0));
        let spec = PatchSpec::new().with_unit("time", UnitSpec::new().with_names(Directive::Proxy, ["tick"]));
        let system = System::new(spec, SystemConfig::default());
        let source = Arc::clone(&ticks);
        system
            .load_unit(
                Namespace::new("time")
                    .with(
                        "tick",
                        Function::new("tick", func(move |_| Ok(Value::Int(source.fetch_add(1, Ordering::SeqCst))))),
                    )
                    .into_ref(),
            )
            .unwrap();
        system.install().unwrap();
        (system, ticks)
    }

    #[test]
    fn test_run_replays_guarded_values() {
        let _id = ThreadKey::root().enter();
        let (system, ticks) = system();
        let outcome = TestRunner::new()
            .run(&system, |s: &System| -> CallResult {
                let a = s.call("time.tick", &[])?;
                let b = s.call("time.tick", &[])?;
                Ok(Value::List(vec![a, b]))
            })
            .unwrap();
        assert_eq!(outcome, Ok(Value::List(vec![Value::Int(0), Value::Int(1)])));
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_both_raised_returns_recorded_exception() {
        let _id = ThreadKey::root().enter();
        let (system, _) = system();
        let mut runs = 0;
        let outcome = TestRunner::new()
            .run(&system, |s: &System| -> CallResult {
                runs += 1;
                s.call("time.tick", &[])?;
                Err(Raised::new("ValueError", format!("run {}", runs)).into())
            })
            .unwrap();
        assert_eq!(outcome, Err(Raised::new("ValueError", "run 1")));
    }

    #[test]
    fn test_outcome_kind_mismatch() {
        let _id = ThreadKey::root().enter();
        let (system, _) = system();
        let runner = TestRunner::new();
        let recording = runner
            .record(&system, |s: &System| -> CallResult {
                s.checkpoint("start")?;
                Ok(Value::Unit)
            })
            .unwrap();
        let err = runner
            .replay(&system, &recording, |s: &System| -> CallResult {
                s.checkpoint("start")?;
                Err(Raised::new("KeyError", "k").into())
            })
            .unwrap_err();
        let divergence = err.as_divergence().unwrap();
        assert_eq!(divergence.kind, DivergenceKind::Outcome);
        assert_eq!(divergence.events.len(), 1);
        assert_eq!(divergence.consumed, 1);
    }

    #[test]
    fn test_return_value_mismatch() {
        let _id = ThreadKey::root().enter();
        let (system, ticks) = system();
        let runner = TestRunner::new();
        let recording = runner
            .record(&system, |s: &System| s.call("time.tick", &[]))
            .unwrap();
        assert_eq!(recording.outcome(), &Ok(Value::Int(0)));

        let base = ticks.load(Ordering::SeqCst);
        let err = runner
            .replay(&system, &recording, move |s: &System| -> CallResult {
                s.call("time.tick", &[])?;
                Ok(Value::Int(base))
            })
            .unwrap_err();
        assert!(err.to_string().contains("replay returned 1"));
        let divergence = err.as_divergence().unwrap();
        assert_eq!(divergence.kind, DivergenceKind::Outcome);
        assert_eq!(divergence.events, vec!["result 0".to_string()]);
        assert_eq!(divergence.consumed, 1);
    }

    #[test]
    fn test_fewer_calls_are_unconsumed() {
        let _id = ThreadKey::root().enter();
        let (system, _) = system();
        let runner = TestRunner::new();
        let recording = runner
            .record(&system, |s: &System| {
                s.call("time.tick", &[])?;
                s.call("time.tick", &[])
            })
            .unwrap();
        let err = runner
            .replay(&system, &recording, |s: &System| s.call("time.tick", &[]))
            .unwrap_err();
        assert_eq!(err.as_divergence().unwrap().kind, DivergenceKind::Unconsumed);
    }

    #[test]
    fn test_diagnose_reports_trace_difference() {
        let _id = ThreadKey::root().enter();
        let (system, _) = system();
        let mut run = 0;
        let diagnosis = TestRunner::new().diagnose(&system, |s: &System| -> CallResult {
            run += 1;
            let name = if run == 1 { "app.first" } else { "app.second" };
            s.traced(CallSite::new(name, "app.rs", 1), || s.call("time.tick", &[]))?
        });
        assert!(!diagnosis.is_clean());
        let report = diagnosis.report.unwrap();
        assert_eq!(report.index, 0);
        assert!(diagnosis.error.is_some());

        let mut steady = |s: &System| -> CallResult { s.traced(CallSite::new("app.main", "app.rs", 1), || s.call("time.tick", &[]))? };
        assert!(TestRunner::new().diagnose(&system, &mut steady).is_clean());
    }

    #[test]
    fn test_hash_order_replays_for_objects_older_than_install() {
        let _id = ThreadKey::root().enter();
        let ty = TypeDef::new("Handle", Vec::new()).into_ref();
        let existing = Object::from(Instance::new(Arc::clone(&ty)));
        let (system, _) = system();

        let outcome = TestRunner::new()
            .run(&system, |s: &System| -> CallResult {
                let fresh = Object::from(Instance::new(Arc::clone(&ty)));
                let mut set = s.ordered_set();
                set.insert(fresh);
                set.insert(existing.clone());
                let order = set.iter().map(|o| Value::Int(i64::from(o.same(&existing)))).collect();
                Ok(Value::List(order))
            })
            .unwrap();
        assert_eq!(outcome, Ok(Value::List(vec![Value::Int(0), Value::Int(1)])));
    }
}
