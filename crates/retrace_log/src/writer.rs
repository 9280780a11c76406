//! Event stream writer.
//!
//! Producers on any thread encode an event into a complete frame and push
//! it onto a bounded queue; a single persister thread appends frames to the
//! sink in queue order. A thread's own appends are sequential, so its
//! subsequence keeps program order, and a frame is never split.

use crate::backpressure::{BackpressureController, BackpressurePolicy, BackpressureStatus};
use crate::encoding::CanonicalEncode;
use crate::event::{CallSite, Envelope, Event, EventKind, EventPayload};
use parking_lot::{Condvar, Mutex};
use retrace_core::{ProcessKey, Raised, RetraceError, RetraceResult, ThreadKey, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

static NEXT_WRITER: AtomicU64 = AtomicU64::new(1);

/// Writer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Frames buffered before backpressure applies
    pub capacity: usize,
    /// What a producer does when the queue is full
    pub backpressure: BackpressurePolicy,
}

impl WriterConfig {
    /// Set queue capacity
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set backpressure policy
    #[must_use]
    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

/// In-memory byte sink shared with the caller
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes written so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Number of bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether nothing was written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
enum Target {
    Memory(SharedBuffer),
    File(PathBuf),
}

impl Target {
    fn open(&self) -> RetraceResult<Sink> {
        match self {
            Self::Memory(buf) => Ok(Sink::Memory(buf.clone())),
            Self::File(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(Sink::File)
                .map_err(|e| RetraceError::record(format!("cannot open {}: {}", path.display(), e))),
        }
    }
}

enum Sink {
    Memory(SharedBuffer),
    File(File),
}

impl Sink {
    fn append(&mut self, frame: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Memory(buf) => {
                buf.0.lock().extend_from_slice(frame);
                Ok(())
            }
            Self::File(file) => file.write_all(frame),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::File(file) => file.flush(),
        }
    }
}

#[derive(Default)]
struct Queue {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
    in_flight: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
    controller: BackpressureController,
    written: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn new(config: &WriterConfig) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
            controller: BackpressureController::new(config.capacity, config.backpressure),
            written: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }
}

fn persist(shared: Arc<Shared>, mut sink: Sink) {
    loop {
        let frame = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(frame) = queue.frames.pop_front() {
                    queue.in_flight = true;
                    shared.not_full.notify_one();
                    break Some(frame);
                }
                if queue.closed {
                    break None;
                }
                shared.not_empty.wait(&mut queue);
            }
        };
        let Some(frame) = frame else { break };

        match sink.append(&frame) {
            Ok(()) => {
                shared.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(error = %e, "event persist failed");
                shared.failure.lock().get_or_insert_with(|| e.to_string());
            }
        }

        let mut queue = shared.queue.lock();
        queue.in_flight = false;
        if queue.frames.is_empty() {
            shared.idle.notify_all();
        }
    }
    if let Err(e) = sink.flush() {
        shared.failure.lock().get_or_insert_with(|| e.to_string());
    }
    shared.idle.notify_all();
}

/// Per-thread write state, kept in thread-local storage keyed by writer id
#[derive(Default)]
struct ThreadWriteState {
    pending_stack: Option<Vec<String>>,
    suppressed: bool,
}

thread_local! {
    static WRITE_STATE: RefCell<Vec<(u64, ThreadWriteState)>> = const { RefCell::new(Vec::new()) };
}

/// Counters reported by [`StreamWriter::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterStats {
    /// Frames persisted
    pub written: u64,
    /// Events dropped by backpressure
    pub dropped: u64,
}

/// Concurrent event stream writer
pub struct StreamWriter {
    id: u64,
    config: WriterConfig,
    target: Target,
    process: AtomicU32,
    shared: Mutex<Arc<Shared>>,
    persister: Mutex<Option<JoinHandle<()>>>,
}

impl StreamWriter {
    /// Writer appending to an in-memory buffer
    ///
    /// # Errors
    ///
    /// Returns error if the persister thread cannot be started
    pub fn memory(config: WriterConfig) -> RetraceResult<(Self, SharedBuffer)> {
        let buffer = SharedBuffer::new();
        let writer = Self::open(Target::Memory(buffer.clone()), config)?;
        Ok((writer, buffer))
    }

    /// Writer appending to the file at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened
    pub fn append_to(path: impl Into<PathBuf>, config: WriterConfig) -> RetraceResult<Self> {
        Self::open(Target::File(path.into()), config)
    }

    fn open(target: Target, config: WriterConfig) -> RetraceResult<Self> {
        let shared = Arc::new(Shared::new(&config));
        let persister = Self::spawn_persister(&target, &shared)?;
        Ok(Self {
            id: NEXT_WRITER.fetch_add(1, Ordering::Relaxed),
            config,
            target,
            process: AtomicU32::new(ProcessKey::current().0),
            shared: Mutex::new(shared),
            persister: Mutex::new(Some(persister)),
        })
    }

    fn spawn_persister(target: &Target, shared: &Arc<Shared>) -> RetraceResult<JoinHandle<()>> {
        let sink = target.open()?;
        let shared = Arc::clone(shared);
        std::thread::Builder::new()
            .name("retrace-persister".to_string())
            .spawn(move || persist(shared, sink))
            .map_err(|e| RetraceError::record(format!("cannot start persister: {}", e)))
    }

    /// Process id stamped on new events
    #[must_use]
    pub fn process(&self) -> ProcessKey {
        ProcessKey(self.process.load(Ordering::Relaxed))
    }

    /// Attach `frames` to the calling thread's next write
    pub fn stacktrace(&self, frames: Vec<String>) {
        self.with_thread_state(|st| st.pending_stack = Some(frames));
    }

    /// Suppress call/return events from the calling thread until its next
    /// result or error
    pub fn sync(&self) {
        self.with_thread_state(|st| st.suppressed = true);
    }

    /// Record the inputs of a guarded call
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn write_call(&self, name: &str, args: &[Value]) -> RetraceResult<()> {
        self.append(EventPayload::Call {
            name: name.to_string(),
            args: args.to_vec(),
        })
    }

    /// Record a successful outcome
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn write_result(&self, value: Value) -> RetraceResult<()> {
        self.append(EventPayload::Result(value))
    }

    /// Record a raised exception
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn write_error(&self, raised: Raised) -> RetraceResult<()> {
        self.append(EventPayload::Error(raised))
    }

    /// Record a labeled checkpoint
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn checkpoint(&self, label: impl Into<Value>) -> RetraceResult<()> {
        self.append(EventPayload::Checkpoint(label.into()))
    }

    /// Record entry into a traced function
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn function_call(&self, site: CallSite) -> RetraceResult<()> {
        self.append(EventPayload::FunctionCall(site))
    }

    /// Record return from a traced function
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn function_return(&self, site: CallSite) -> RetraceResult<()> {
        self.append(EventPayload::FunctionReturn(site))
    }

    /// Mark the start of a finalizer callback
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn weakref_callback_start(&self) -> RetraceResult<()> {
        self.append(EventPayload::WeakrefCallbackStart)
    }

    /// Mark the end of a finalizer callback
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn weakref_callback_end(&self) -> RetraceResult<()> {
        self.append(EventPayload::WeakrefCallbackEnd)
    }

    /// Record a monitoring sample
    ///
    /// # Errors
    ///
    /// Returns error if the writer is closed or encoding fails
    pub fn monitor(&self, value: Value) -> RetraceResult<()> {
        self.append(EventPayload::Monitor(value))
    }

    fn with_thread_state<R>(&self, f: impl FnOnce(&mut ThreadWriteState) -> R) -> R {
        WRITE_STATE.with(|states| {
            let mut states = states.borrow_mut();
            let pos = match states.iter().position(|(id, _)| *id == self.id) {
                Some(pos) => pos,
                None => {
                    states.push((self.id, ThreadWriteState::default()));
                    states.len() - 1
                }
            };
            f(&mut states[pos].1)
        })
    }

    fn append(&self, payload: EventPayload) -> RetraceResult<()> {
        let mut event = Event::new(payload);
        let kind = event.kind();
        let stack = self.with_thread_state(|st| {
            if kind.is_instrumentation() {
                return if st.suppressed { None } else { Some(None) };
            }
            if matches!(kind, EventKind::Result | EventKind::Error) {
                st.suppressed = false;
            }
            Some(st.pending_stack.take())
        });
        // Suppressed by sync().
        let Some(stack) = stack else { return Ok(()) };
        event.stack = stack;

        let envelope = Envelope {
            process: self.process(),
            thread: ThreadKey::current(),
            event,
        };
        let frame = envelope
            .encode_frame()
            .map_err(|e| RetraceError::record(e.to_string()))?;
        tracing::trace!(thread = %envelope.thread, event = %envelope.event, "append");
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: Vec<u8>) -> RetraceResult<()> {
        let shared = Arc::clone(&self.shared.lock());
        let deadline = self.config.backpressure.deadline(Instant::now());
        let mut queue = shared.queue.lock();
        loop {
            if queue.closed {
                return Err(RetraceError::record("writer is closed"));
            }
            match shared.controller.status(queue.frames.len(), deadline, Instant::now()) {
                BackpressureStatus::Accept => {
                    queue.frames.push_back(frame);
                    shared.not_empty.notify_one();
                    return Ok(());
                }
                BackpressureStatus::Wait => match deadline {
                    Some(deadline) => {
                        let _ = shared.not_full.wait_until(&mut queue, deadline);
                    }
                    None => shared.not_full.wait(&mut queue),
                },
                BackpressureStatus::Drop => {
                    shared.controller.record_drop();
                    tracing::warn!(
                        dropped = shared.controller.dropped(),
                        "event queue full, dropping event"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Wait until every queued frame has been persisted
    ///
    /// # Errors
    ///
    /// Returns error if persisting any frame failed
    pub fn flush(&self) -> RetraceResult<()> {
        let shared = Arc::clone(&self.shared.lock());
        {
            let mut queue = shared.queue.lock();
            while !queue.frames.is_empty() || queue.in_flight {
                if queue.closed && self.persister.lock().is_none() {
                    break;
                }
                shared.idle.wait(&mut queue);
            }
        }
        match shared.failure.lock().clone() {
            Some(reason) => Err(RetraceError::record(reason)),
            None => Ok(()),
        }
    }

    /// Persist everything queued and stop the persister. Later appends fail.
    ///
    /// # Errors
    ///
    /// Returns error if persisting any frame failed
    pub fn close(&self) -> RetraceResult<()> {
        let shared = Arc::clone(&self.shared.lock());
        {
            let mut queue = shared.queue.lock();
            queue.closed = true;
            shared.not_empty.notify_all();
            shared.not_full.notify_all();
        }
        if let Some(handle) = self.persister.lock().take() {
            if handle.join().is_err() {
                return Err(RetraceError::record("persister thread panicked"));
            }
        }
        match shared.failure.lock().clone() {
            Some(reason) => Err(RetraceError::record(reason)),
            None => Ok(()),
        }
    }

    /// Re-open the sink in a freshly forked child.
    ///
    /// The persister thread does not exist in the child, so its queue and
    /// handle are abandoned without being joined. Frames still queued at
    /// fork time belong to the parent and are not written twice. Events
    /// written afterwards carry `process`.
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot be re-opened
    pub fn reopen_after_fork(&self, process: ProcessKey) -> RetraceResult<()> {
        let fresh = Arc::new(Shared::new(&self.config));
        let persister = Self::spawn_persister(&self.target, &fresh)?;
        let stale_shared = std::mem::replace(&mut *self.shared.lock(), fresh);
        let stale_handle = self.persister.lock().replace(persister);
        std::mem::forget(stale_shared);
        std::mem::forget(stale_handle);
        self.process.store(process.0, Ordering::Relaxed);
        tracing::debug!(%process, "writer re-opened after fork");
        Ok(())
    }

    /// Written and dropped counts
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        let shared = self.shared.lock();
        WriterStats {
            written: shared.written.load(Ordering::Relaxed),
            dropped: shared.controller.dropped(),
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "writer closed with errors");
        }
        let id = self.id;
        let _ = WRITE_STATE.try_with(|states| {
            if let Ok(mut states) = states.try_borrow_mut() {
                states.retain(|(owner, _)| *owner != id);
            }
        });
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("process", &self.process())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::FrameDecoder;
    use std::io::Cursor;

    fn decode_all(bytes: Vec<u8>) -> Vec<Envelope> {
        let mut decoder = FrameDecoder::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(env) = decoder.decode::<Envelope>().unwrap() {
            out.push(env);
        }
        out
    }

    #[test]
    fn test_writes_in_order() {
        let (writer, buffer) = StreamWriter::memory(WriterConfig::default()).unwrap();
        writer.write_result(Value::Int(1)).unwrap();
        writer.checkpoint("mid").unwrap();
        writer.write_error(Raised::new("OSError", "nope")).unwrap();
        writer.close().unwrap();

        let kinds: Vec<_> = decode_all(buffer.snapshot())
            .iter()
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(kinds, vec![EventKind::Result, EventKind::Checkpoint, EventKind::Error]);
        assert_eq!(writer.stats().written, 3);
    }

    #[test]
    fn test_stacktrace_attaches_to_next_write() {
        let (writer, buffer) = StreamWriter::memory(WriterConfig::default()).unwrap();
        writer.stacktrace(vec!["main".to_string()]);
        writer.write_result(Value::Unit).unwrap();
        writer.write_result(Value::Unit).unwrap();
        writer.close().unwrap();

        let events = decode_all(buffer.snapshot());
        assert_eq!(events[0].event.stack, Some(vec!["main".to_string()]));
        assert_eq!(events[1].event.stack, None);
    }

    #[test]
    fn test_sync_suppresses_until_result() {
        let (writer, buffer) = StreamWriter::memory(WriterConfig::default()).unwrap();
        let site = CallSite::new("f", "lib.rs", 3);
        writer.sync();
        writer.function_call(site.clone()).unwrap();
        writer.function_return(site.clone()).unwrap();
        writer.write_result(Value::Int(0)).unwrap();
        writer.function_call(site).unwrap();
        writer.close().unwrap();

        let kinds: Vec<_> = decode_all(buffer.snapshot())
            .iter()
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(kinds, vec![EventKind::Result, EventKind::FunctionCall]);
    }

    #[test]
    fn test_events_tagged_with_thread() {
        let (writer, buffer) = StreamWriter::memory(WriterConfig::default()).unwrap();
        let writer = Arc::new(writer);
        let _root = ThreadKey::root().enter();
        writer.write_result(Value::Int(0)).unwrap();

        let child = ThreadKey::next_child();
        let w = Arc::clone(&writer);
        std::thread::spawn(move || {
            let _id = child.enter();
            w.write_result(Value::Int(1)).unwrap();
        })
        .join()
        .unwrap();
        writer.close().unwrap();

        let events = decode_all(buffer.snapshot());
        assert_eq!(events.len(), 2);
        assert!(events[0].thread.is_root());
        assert_eq!(events[1].thread, ThreadKey::root().child(0));
        assert_eq!(events[0].process, ProcessKey::current());
    }

    #[test]
    fn test_concurrent_writers_keep_per_thread_order() {
        let (writer, buffer) = StreamWriter::memory(WriterConfig::default().with_capacity(4)).unwrap();
        let writer = Arc::new(writer);
        let _root = ThreadKey::root().enter();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let key = ThreadKey::next_child();
                let w = Arc::clone(&writer);
                std::thread::spawn(move || {
                    let _id = key.enter();
                    for i in 0..50 {
                        w.write_result(Value::Int(i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        writer.close().unwrap();

        let events = decode_all(buffer.snapshot());
        assert_eq!(events.len(), 200);
        for t in 0..4 {
            let key = ThreadKey::root().child(t);
            let values: Vec<_> = events
                .iter()
                .filter(|e| e.thread == key)
                .map(|e| e.event.payload.clone())
                .collect();
            let expected: Vec<_> = (0..50).map(|i| EventPayload::Result(Value::Int(i))).collect();
            assert_eq!(values, expected);
        }
    }

    #[test]
    fn test_closed_writer_rejects_appends() {
        let (writer, _buffer) = StreamWriter::memory(WriterConfig::default()).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.write_result(Value::Unit),
            Err(RetraceError::Record { .. })
        ));
    }

    #[test]
    fn test_flush_waits_for_persist() {
        let (writer, buffer) = StreamWriter::memory(WriterConfig::default()).unwrap();
        writer.write_result(Value::Int(5)).unwrap();
        writer.flush().unwrap();
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.bin");
        std::fs::write(&path, b"").unwrap();
        let writer = StreamWriter::append_to(&path, WriterConfig::default()).unwrap();
        writer.write_result(Value::from("x")).unwrap();
        writer.close().unwrap();

        let events = decode_all(std::fs::read(&path).unwrap());
        assert_eq!(events.len(), 1);
    }
}
