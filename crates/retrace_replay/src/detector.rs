//! Replay divergence detector.
//!
//! Compares function call/return events produced during replay, in strict
//! order, with the ones recorded on the same logical thread. The first
//! mismatch is kept as a [`DivergenceReport`] for the harness and raised as
//! a trace divergence.

use crate::diff::{DivergenceReport, StackDifference};
use crate::trace::TraceEvent;
use parking_lot::Mutex;
use retrace_core::{DivergenceKind, RetraceResult, ThreadKey};
use retrace_log::{CallSite, EventKind, StreamReader};
use std::collections::HashMap;
use std::sync::Arc;

/// Detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Events of context kept on each side of a report
    pub context: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { context: 5 }
    }
}

impl DetectorConfig {
    /// Set the report context
    #[must_use]
    pub fn with_context(mut self, context: usize) -> Self {
        self.context = context;
        self
    }
}

#[derive(Default)]
struct ThreadTrace {
    matched: Vec<TraceEvent>,
    suppressed: bool,
    last_stack: Option<Vec<String>>,
}

/// Compares replayed call traces against a recording
pub struct DivergenceDetector {
    reader: Arc<StreamReader>,
    config: DetectorConfig,
    threads: Mutex<HashMap<ThreadKey, ThreadTrace>>,
    report: Mutex<Option<DivergenceReport>>,
    stack_differences: Mutex<Vec<StackDifference>>,
}

impl DivergenceDetector {
    /// Create a detector reading from `reader`
    #[must_use]
    pub fn new(reader: Arc<StreamReader>, config: DetectorConfig) -> Self {
        Self {
            reader,
            config,
            threads: Mutex::new(HashMap::new()),
            report: Mutex::new(None),
            stack_differences: Mutex::new(Vec::new()),
        }
    }

    /// A function was entered during replay
    ///
    /// # Errors
    ///
    /// Returns a trace divergence if the recording has a different event
    pub fn on_call(&self, site: &CallSite) -> RetraceResult<()> {
        self.check(TraceEvent::Call(site.clone()))
    }

    /// A function returned during replay
    ///
    /// # Errors
    ///
    /// Returns a trace divergence if the recording has a different event
    pub fn on_return(&self, site: &CallSite) -> RetraceResult<()> {
        self.check(TraceEvent::Return(site.clone()))
    }

    /// Stop comparing on the calling thread until its next guarded result
    pub fn sync(&self) {
        self.with_thread(|t| t.suppressed = true);
    }

    /// A guarded result was replayed on the calling thread
    pub fn on_result(&self) {
        self.with_thread(|t| t.suppressed = false);
    }

    /// Compare the stack recorded with the next outcome against the stack
    /// captured now. Differences are logged and kept.
    pub fn compare_stacks(&self, recorded: &[String], replayed: &[String]) -> Option<StackDifference> {
        let previous = self.with_thread(|t| t.last_stack.clone());
        let difference = StackDifference::compute(previous.as_deref(), recorded, replayed);
        match &difference {
            Some(diff) => {
                tracing::warn!(thread = %ThreadKey::current(), "stack difference\n{}", diff);
                self.stack_differences.lock().push(diff.clone());
            }
            None => self.with_thread(|t| t.last_stack = Some(recorded.to_vec())),
        }
        difference
    }

    /// First divergence found, if any
    #[must_use]
    pub fn report(&self) -> Option<DivergenceReport> {
        self.report.lock().clone()
    }

    /// Stack differences found so far
    #[must_use]
    pub fn stack_differences(&self) -> Vec<StackDifference> {
        self.stack_differences.lock().clone()
    }

    /// Trace events matched on the calling thread
    #[must_use]
    pub fn matched(&self) -> usize {
        self.with_thread(|t| t.matched.len())
    }

    fn with_thread<R>(&self, f: impl FnOnce(&mut ThreadTrace) -> R) -> R {
        let mut threads = self.threads.lock();
        f(threads.entry(ThreadKey::current()).or_default())
    }

    fn check(&self, event: TraceEvent) -> RetraceResult<()> {
        if self.with_thread(|t| t.suppressed) {
            return Ok(());
        }

        let recorded = loop {
            match self.reader.peek_event()? {
                Some(e) if e.kind().is_bracket() => {
                    self.reader.next_event()?;
                }
                Some(e) if e.kind() == EventKind::Monitor && !self.reader.config().monitor => {
                    self.reader.next_event()?;
                }
                other => break other,
            }
        };

        if recorded.as_ref().and_then(TraceEvent::from_event).as_ref() == Some(&event) {
            self.reader.next_event()?;
            tracing::trace!(%event, "trace matched");
            self.with_thread(|t| t.matched.push(event));
            return Ok(());
        }

        let report = self.build_report(event);
        let message = report.to_string();
        self.report.lock().get_or_insert(report);
        Err(self.reader.divergence(DivergenceKind::Trace, message))
    }

    fn build_report(&self, replayed: TraceEvent) -> DivergenceReport {
        let matched = self.with_thread(|t| t.matched.clone());
        let consumed = self.reader.consumed();
        let upcoming: Vec<String> = self
            .reader
            .rendered_events()
            .into_iter()
            .skip(consumed)
            .take(self.config.context)
            .collect();

        let common_from = matched.len().saturating_sub(self.config.context);
        DivergenceReport {
            thread: ThreadKey::current().to_string(),
            index: matched.len(),
            common: matched[common_from..].iter().map(ToString::to_string).collect(),
            recorded: upcoming,
            replayed: vec![replayed.to_string()],
        }
    }
}

impl std::fmt::Debug for DivergenceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DivergenceDetector")
            .field("config", &self.config)
            .field("diverged", &self.report.lock().is_some())
            .finish_non_exhaustive()
    }
}
