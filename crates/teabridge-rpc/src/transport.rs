//! Sentinel-delimited frame codec.
//!
//! Frames are compact JSON records terminated by a single ASCII record
//! separator byte:
//!
//! ```text
//! +------------------+------+------------------+------+
//! |  JSON frame      | 0x1E |  JSON frame      | 0x1E | ...
//! +------------------+------+------------------+------+
//! ```
//!
//! `serde_json` escapes every control character inside strings (`\u001e`) and
//! emits none outside them, so the separator can never occur inside an encoded
//! frame. The underlying transport may split or coalesce frames arbitrarily;
//! [`FrameCodec`] and [`FrameReassembler`] only yield complete frames.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::Frame;

/// Frame separator.
pub const SENTINEL: u8 = 0x1E;

/// Frame separator as a string, for text transports.
pub const SENTINEL_STR: &str = "\u{1e}";

/// Maximum size of a single frame (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a frame as JSON text followed by the sentinel.
///
/// # Errors
///
/// Returns an error if the frame cannot be serialized or exceeds the size limit.
pub fn encode_frame(frame: &Frame) -> Result<String, CodecError> {
    let mut json = serde_json::to_string(frame)?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(json.len()));
    }
    json.push_str(SENTINEL_STR);
    Ok(json)
}

/// Decode a single frame (without its trailing sentinel).
///
/// # Errors
///
/// Returns an error if the text is not a well-formed frame record.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(CodecError::InvalidFrame("frame is not a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|e| CodecError::InvalidFrame(e.to_string()))
}

/// Codec for sentinel-delimited JSON frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    // Bytes already scanned for the sentinel, so partial frames are not rescanned.
    scanned: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = self.scanned.min(src.len());
        let Some(offset) = src[start..].iter().position(|b| *b == SENTINEL) else {
            if src.len() > MAX_FRAME_SIZE {
                let len = src.len();
                src.clear();
                self.scanned = 0;
                return Err(CodecError::FrameTooLarge(len));
            }
            self.scanned = src.len();
            return Ok(None);
        };

        let end = start + offset;
        self.scanned = 0;

        let mut chunk = src.split_to(end + 1);
        chunk.truncate(end);

        let text = std::str::from_utf8(&chunk)?;
        decode_frame(text).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let text = encode_frame(&item)?;
        dst.reserve(text.len());
        dst.put_slice(text.as_bytes());
        Ok(())
    }
}

/// Receive-side buffer that turns arbitrary chunks into complete frames.
///
/// A malformed frame produces one `Err` entry; decoding continues with the
/// frames that follow it.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw input and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Frame, CodecError>> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}
