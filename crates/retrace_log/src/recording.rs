//! Recording files.
//!
//! Layout: preamble, header frame, then event envelopes appended by every
//! process taking part in the recording.

use crate::encoding::{DecodeError, FrameDecoder, FrameEncoder};
use crate::header::RecordingHeader;
use crate::reader::{ReaderConfig, StreamReader};
use crate::writer::{StreamWriter, WriterConfig};
use retrace_core::{RetraceError, RetraceResult};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// A recording on disk
#[derive(Debug, Clone)]
pub struct RecordingFile {
    path: PathBuf,
    header: RecordingHeader,
}

impl RecordingFile {
    /// Create (or truncate) a recording and write its header
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn create(path: impl Into<PathBuf>, header: RecordingHeader) -> RetraceResult<Self> {
        let path = path.into();
        let file = File::create(&path)
            .map_err(|e| RetraceError::record(format!("cannot create {}: {}", path.display(), e)))?;
        let mut encoder = FrameEncoder::new(file);
        encoder
            .write_preamble()
            .and_then(|()| encoder.encode(&header))
            .map_err(|e| RetraceError::record(e.to_string()))?;
        encoder
            .flush()
            .map_err(|e| RetraceError::record(e.to_string()))?;
        tracing::debug!(path = %path.display(), id = %header.id, "recording created");
        Ok(Self { path, header })
    }

    /// Open an existing recording and read its header
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::RecordingNotFound`] if nothing exists at
    /// `path`, and a configuration or version error if the file is not a
    /// readable recording
    pub fn open(path: impl Into<PathBuf>) -> RetraceResult<Self> {
        let path = path.into();
        let mut decoder = Self::decoder(&path)?;
        let header = Self::read_header(&mut decoder)?;
        Ok(Self { path, header })
    }

    fn decoder(path: &Path) -> RetraceResult<FrameDecoder<Box<dyn Read + Send>>> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RetraceError::RecordingNotFound {
                path: path.display().to_string(),
            },
            _ => RetraceError::replay(format!("cannot open {}: {}", path.display(), e)),
        })?;
        let reader: Box<dyn Read + Send> = Box::new(BufReader::new(file));
        Ok(FrameDecoder::new(reader))
    }

    fn read_header(decoder: &mut FrameDecoder<Box<dyn Read + Send>>) -> RetraceResult<RecordingHeader> {
        decoder.read_preamble().map_err(|e| match e {
            DecodeError::UnsupportedFormat { .. } => RetraceError::version_mismatch(e.to_string()),
            _ => RetraceError::configuration(e.to_string()),
        })?;
        decoder
            .decode::<RecordingHeader>()
            .map_err(|e| RetraceError::configuration(format!("malformed header: {}", e)))?
            .ok_or_else(|| RetraceError::configuration("recording has no header"))
    }

    /// Recording header
    #[must_use]
    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    /// Location on disk
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writer appending events to this recording
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened
    pub fn writer(&self, config: WriterConfig) -> RetraceResult<StreamWriter> {
        StreamWriter::append_to(self.path.clone(), config)
    }

    /// Reader over this recording's events, starting with the process that
    /// began the recording
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be re-read
    pub fn reader(&self, config: ReaderConfig) -> RetraceResult<StreamReader> {
        let mut decoder = Self::decoder(&self.path)?;
        Self::read_header(&mut decoder)?;
        Ok(StreamReader::new(decoder, self.header.process, config))
    }
}
