//! Demultiplexing event stream reader.
//!
//! The physical stream interleaves events from every thread of every
//! process. Each replaying thread consumes only its own `(process, thread)`
//! subsequence; frames belonging to other threads are parked in per-thread
//! queues until their owner asks for them.

use crate::encoding::{DecodeError, FrameDecoder};
use crate::event::{Envelope, Event, EventKind, EventPayload};
use parking_lot::Mutex;
use retrace_core::{
    CallError, CallResult, Divergence, DivergenceKind, ProcessKey, RetraceError, RetraceResult,
    ThreadKey, Value,
};
use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU32, Ordering};

type StreamKey = (ProcessKey, ThreadKey);

/// Reader configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderConfig {
    /// Compare monitor samples instead of skipping them
    pub monitor: bool,
}

impl ReaderConfig {
    /// Enable monitor comparison
    #[must_use]
    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }
}

#[derive(Default)]
struct Subsequence {
    pending: VecDeque<Event>,
    consumed: Vec<Event>,
}

struct Demux {
    decoder: FrameDecoder<Box<dyn Read + Send>>,
    eof: bool,
    streams: HashMap<StreamKey, Subsequence>,
}

impl Demux {
    fn decode_one(&mut self) -> RetraceResult<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.decoder.decode::<Envelope>() {
            Ok(Some(env)) => {
                self.streams
                    .entry((env.process, env.thread))
                    .or_default()
                    .pending
                    .push_back(env.event);
                Ok(true)
            }
            Ok(None) => {
                self.eof = true;
                Ok(false)
            }
            Err(e) => {
                self.eof = true;
                Err(decode_error(&e))
            }
        }
    }

    fn fill(&mut self, key: &StreamKey) -> RetraceResult<()> {
        while self
            .streams
            .get(key)
            .is_none_or(|s| s.pending.is_empty())
        {
            if !self.decode_one()? {
                break;
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> RetraceResult<()> {
        while self.decode_one()? {}
        Ok(())
    }
}

fn decode_error(e: &DecodeError) -> RetraceError {
    match e {
        DecodeError::UnsupportedFormat { .. } => RetraceError::version_mismatch(e.to_string()),
        DecodeError::BadMagic => RetraceError::configuration(e.to_string()),
        _ => RetraceError::replay(e.to_string()),
    }
}

/// Concurrent event stream reader
pub struct StreamReader {
    demux: Mutex<Demux>,
    process: AtomicU32,
    config: ReaderConfig,
}

impl StreamReader {
    /// Reader over a stream of frames with no preamble or header
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>, process: ProcessKey, config: ReaderConfig) -> Self {
        Self::new(
            FrameDecoder::new(Box::new(Cursor::new(bytes))),
            process,
            config,
        )
    }

    /// Reader continuing from `decoder`, consuming `process`'s events first
    #[must_use]
    pub fn new(
        decoder: FrameDecoder<Box<dyn Read + Send>>,
        process: ProcessKey,
        config: ReaderConfig,
    ) -> Self {
        Self {
            demux: Mutex::new(Demux {
                decoder,
                eof: false,
                streams: HashMap::new(),
            }),
            process: AtomicU32::new(process.0),
            config,
        }
    }

    /// Process whose events are being consumed
    #[must_use]
    pub fn process(&self) -> ProcessKey {
        ProcessKey(self.process.load(Ordering::Relaxed))
    }

    /// Reader configuration
    #[must_use]
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Follow `process`'s events from now on
    pub fn switch_process(&self, process: ProcessKey) {
        tracing::debug!(from = %self.process(), to = %process, "reader switching process");
        self.process.store(process.0, Ordering::Relaxed);
    }

    fn key(&self) -> StreamKey {
        (self.process(), ThreadKey::current())
    }

    /// Next raw event of the calling thread, without consuming it
    ///
    /// # Errors
    ///
    /// Returns error if the stream is corrupt
    pub fn peek_event(&self) -> RetraceResult<Option<Event>> {
        let key = self.key();
        let mut demux = self.demux.lock();
        demux.fill(&key)?;
        Ok(demux
            .streams
            .get(&key)
            .and_then(|s| s.pending.front().cloned()))
    }

    /// Consume the next raw event of the calling thread
    ///
    /// # Errors
    ///
    /// Returns error if the stream is corrupt
    pub fn next_event(&self) -> RetraceResult<Option<Event>> {
        let key = self.key();
        let mut demux = self.demux.lock();
        demux.fill(&key)?;
        let Some(stream) = demux.streams.get_mut(&key) else {
            return Ok(None);
        };
        let event = stream.pending.pop_front();
        if let Some(event) = &event {
            stream.consumed.push(event.clone());
        }
        Ok(event)
    }

    fn is_transparent(&self, kind: EventKind) -> bool {
        kind.is_instrumentation()
            || kind.is_bracket()
            || (kind == EventKind::Monitor && !self.config.monitor)
            || kind == EventKind::Call
    }

    /// Consume events up to the next one a replay does not skip
    fn next_significant(&self) -> RetraceResult<Option<Event>> {
        loop {
            let Some(event) = self.next_event()? else {
                return Ok(None);
            };
            if !self.is_transparent(event.kind()) {
                return Ok(Some(event));
            }
        }
    }

    /// Stack captured with the next outcome or checkpoint, without
    /// consuming it. Skipped events before it are consumed.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is corrupt
    pub fn next_stack(&self) -> RetraceResult<Option<Vec<String>>> {
        loop {
            match self.peek_event()? {
                Some(event) if self.is_transparent(event.kind()) => {
                    self.next_event()?;
                }
                Some(event) => return Ok(event.stack),
                None => return Ok(None),
            }
        }
    }

    /// Replay the next guarded outcome of the calling thread
    ///
    /// # Errors
    ///
    /// Re-raises a recorded exception as [`CallError::Raised`]; fails with
    /// [`RetraceError::Exhausted`] when the thread has no events left and
    /// with a divergence when the next event is not an outcome
    pub fn read_result(&self) -> CallResult {
        match self.next_significant()? {
            Some(Event {
                payload: EventPayload::Result(value),
                ..
            }) => Ok(value),
            Some(Event {
                payload: EventPayload::Error(raised),
                ..
            }) => Err(CallError::Raised(raised)),
            Some(other) => Err(self
                .divergence(
                    DivergenceKind::Structure,
                    format!("expected a result, recording has {}", other),
                )
                .into()),
            None => Err(self.exhausted().into()),
        }
    }

    /// Check the inputs of a guarded call against the recording. A no-op
    /// when the recording has no input events at this point.
    ///
    /// # Errors
    ///
    /// Returns a divergence if the recorded call differs
    pub fn expect_call(&self, name: &str, args: &[Value]) -> RetraceResult<()> {
        loop {
            match self.peek_event()? {
                Some(event) if event.kind().is_instrumentation() || event.kind().is_bracket() => {
                    self.next_event()?;
                }
                Some(Event {
                    payload:
                        EventPayload::Call {
                            name: recorded,
                            args: recorded_args,
                        },
                    ..
                }) => {
                    self.next_event()?;
                    if recorded != name || recorded_args != args {
                        return Err(self.divergence(
                            DivergenceKind::Structure,
                            format!("expected call {}, recording has call {}", name, recorded),
                        ));
                    }
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    /// Consume the next checkpoint and compare its label
    ///
    /// # Errors
    ///
    /// Returns a divergence if the label or event kind differs, or
    /// [`RetraceError::Exhausted`] if no events remain
    pub fn checkpoint(&self, label: impl Into<Value>) -> RetraceResult<()> {
        let label = label.into();
        let index = self.consumed();
        match self.next_significant()? {
            Some(Event {
                payload: EventPayload::Checkpoint(recorded),
                ..
            }) if recorded == label => Ok(()),
            Some(other) => Err(self.divergence(
                DivergenceKind::Checkpoint,
                format!(
                    "checkpoint divergence at event {}: expected {}, got {}",
                    index, other, label
                ),
            )),
            None => Err(self.exhausted()),
        }
    }

    /// Compare a monitor sample. A no-op unless monitoring is enabled.
    ///
    /// # Errors
    ///
    /// Returns a divergence if the recorded sample differs
    pub fn monitor_checkpoint(&self, value: Value) -> RetraceResult<()> {
        if !self.config.monitor {
            return Ok(());
        }
        match self.next_significant()? {
            Some(Event {
                payload: EventPayload::Monitor(recorded),
                ..
            }) if recorded == value => Ok(()),
            Some(other) => Err(self.divergence(
                DivergenceKind::Checkpoint,
                format!("monitor divergence: expected {}, got monitor {}", other, value),
            )),
            None => Err(self.exhausted()),
        }
    }

    /// Events consumed by the calling thread
    #[must_use]
    pub fn consumed(&self) -> usize {
        let key = self.key();
        self.demux
            .lock()
            .streams
            .get(&key)
            .map_or(0, |s| s.consumed.len())
    }

    /// Outcome and checkpoint events of the current process that no thread
    /// consumed. Reads the rest of the stream.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is corrupt
    pub fn unconsumed(&self) -> RetraceResult<usize> {
        let process = self.process();
        let mut demux = self.demux.lock();
        demux.drain()?;
        Ok(demux
            .streams
            .iter()
            .filter(|((p, _), _)| *p == process)
            .flat_map(|(_, s)| s.pending.iter())
            .filter(|e| e.kind().is_tape())
            .count())
    }

    /// The calling thread's recorded events seen so far, rendered
    #[must_use]
    pub fn rendered_events(&self) -> Vec<String> {
        let key = self.key();
        let demux = self.demux.lock();
        demux
            .streams
            .get(&key)
            .map(|s| {
                s.consumed
                    .iter()
                    .chain(s.pending.iter())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build a divergence carrying the calling thread's event context
    #[must_use]
    pub fn divergence(&self, kind: DivergenceKind, message: impl Into<String>) -> RetraceError {
        let message = message.into();
        tracing::error!(thread = %ThreadKey::current(), %kind, "{}", message);
        RetraceError::divergence(
            Divergence::new(kind, message).with_events(self.rendered_events(), self.consumed()),
        )
    }

    fn exhausted(&self) -> RetraceError {
        RetraceError::Exhausted {
            thread: ThreadKey::current().to_string(),
            consumed: self.consumed(),
        }
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("process", &self.process())
            .field("config", &self.config)
            .finish()
    }
}
