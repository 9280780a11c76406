//! RETRACE Event Stream
//!
//! The ordered event log shared by the recording writer and the replaying
//! reader: event types, length-prefixed canonical framing, a concurrent
//! writer with backpressure, a per-thread demultiplexing reader, and the
//! recording header and file layout.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backpressure;
pub mod encoding;
pub mod event;
pub mod header;
pub mod reader;
pub mod recording;
pub mod writer;

pub use backpressure::{BackpressureController, BackpressurePolicy, BackpressureStatus};
pub use encoding::{CanonicalDecode, CanonicalEncode, DecodeError, EncodeError, FrameDecoder, FrameEncoder};
pub use event::{CallSite, Envelope, Event, EventKind, EventPayload};
pub use header::{RecordingHeader, RecordingOptions, RuntimeFingerprint};
pub use reader::{ReaderConfig, StreamReader};
pub use recording::RecordingFile;
pub use writer::{SharedBuffer, StreamWriter, WriterConfig, WriterStats};
