//! Canonical encoding and framing.
//!
//! Uses postcard for byte-stable encoding. Frames are a big-endian `u32`
//! length followed by the encoded bytes. A recording starts with a short
//! preamble: the magic bytes and the format version.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Magic bytes at the start of every recording
pub const MAGIC: [u8; 4] = *b"RTRC";

/// Current recording format version
pub const FORMAT_VERSION: u16 = 1;

/// Largest frame accepted by the decoder
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Trait for canonical serialization
pub trait CanonicalEncode: Serialize {
    /// Encode to canonical bytes
    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        postcard::to_allocvec(self).map_err(|e| EncodeError::Serialize(e.to_string()))
    }

    /// Encode as a single length-prefixed frame
    fn encode_frame(&self) -> Result<Vec<u8>, EncodeError> {
        let body = self.encode()?;
        let len = u32::try_from(body.len()).map_err(|_| EncodeError::FrameTooLarge(body.len()))?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Trait for canonical deserialization
pub trait CanonicalDecode<'de>: Deserialize<'de> {
    /// Decode from canonical bytes
    fn decode(data: &'de [u8]) -> Result<Self, DecodeError>
    where
        Self: Sized,
    {
        postcard::from_bytes(data).map_err(|e| DecodeError::InvalidEncoding(e.to_string()))
    }
}

impl<'de, T: Deserialize<'de>> CanonicalDecode<'de> for T {}

/// Encoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// Value could not be serialized
    #[error("Serialization failed: {0}")]
    Serialize(String),
    /// Frame length does not fit the length prefix
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// Underlying writer failed
    #[error("Write failed: {0}")]
    Io(String),
}

/// Decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Invalid encoding
    #[error("Invalid canonical encoding: {0}")]
    InvalidEncoding(String),
    /// Stream ended inside a frame
    #[error("Truncated frame")]
    Truncated,
    /// Length prefix larger than allowed
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// Stream does not start with the recording magic
    #[error("Not a recording (bad magic)")]
    BadMagic,
    /// Recording uses another format version
    #[error("Unsupported format version {found} (expected {expected})")]
    UnsupportedFormat {
        /// Version in the stream
        found: u16,
        /// Version this build reads
        expected: u16,
    },
    /// Underlying reader failed
    #[error("Read failed: {0}")]
    Io(String),
}

/// The recording preamble
#[must_use]
pub fn preamble() -> [u8; 6] {
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&MAGIC);
    out[4..].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    out
}

/// Canonical encoder for streaming
pub struct FrameEncoder<W> {
    writer: W,
}

impl<W: Write> FrameEncoder<W> {
    /// Create a new encoder
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write the recording preamble
    pub fn write_preamble(&mut self) -> Result<(), EncodeError> {
        self.writer
            .write_all(&preamble())
            .map_err(|e| EncodeError::Io(e.to_string()))
    }

    /// Encode a value as one frame, appended with a single write
    pub fn encode<T: CanonicalEncode>(&mut self, value: &T) -> Result<(), EncodeError> {
        let frame = value.encode_frame()?;
        self.write_frame(&frame)
    }

    /// Append an already-encoded frame
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), EncodeError> {
        self.writer
            .write_all(frame)
            .map_err(|e| EncodeError::Io(e.to_string()))
    }

    /// Flush the writer
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Get a reference to the inner writer
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Consume and return the inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Canonical decoder for streaming
pub struct FrameDecoder<R> {
    reader: R,
}

impl<R: Read> FrameDecoder<R> {
    /// Create a new decoder
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read and check the recording preamble
    pub fn read_preamble(&mut self) -> Result<(), DecodeError> {
        let mut buf = [0u8; 6];
        match self.fill(&mut buf)? {
            0 => return Err(DecodeError::BadMagic),
            n if n < buf.len() => return Err(DecodeError::Truncated),
            _ => {}
        }
        if buf[..4] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let found = u16::from_be_bytes([buf[4], buf[5]]);
        if found != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedFormat {
                found,
                expected: FORMAT_VERSION,
            });
        }
        Ok(())
    }

    /// Decode the next frame, or `None` at a clean end of stream
    pub fn decode<T: for<'de> Deserialize<'de>>(&mut self) -> Result<Option<T>, DecodeError> {
        let mut len_bytes = [0u8; 4];
        match self.fill(&mut len_bytes)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(DecodeError::Truncated),
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(len));
        }
        let mut buffer = vec![0u8; len];
        if self.fill(&mut buffer)? < len {
            return Err(DecodeError::Truncated);
        }

        postcard::from_bytes(&buffer)
            .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))
            .map(Some)
    }

    // Reads until `buf` is full or the stream ends; returns bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, DecodeError> {
        let mut read = 0;
        while read < buf.len() {
            match self.reader.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DecodeError::Io(e.to_string())),
            }
        }
        Ok(read)
    }
}
