//! Codec for encoding and decoding QuickChat frames.
//!
//! Binary frames are MessagePack with a 4-byte big-endian length prefix.
//! Text frames are plain JSON with the same shape.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

fn frame_length(data: &[u8]) -> Result<usize, ProtocolError> {
    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = frame_length(data)?;
    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = frame_length(buf)?;
    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_json(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_json(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encoding used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Length-prefixed MessagePack in binary messages.
    #[default]
    Binary,
    /// JSON in text messages.
    Text,
}

/// An encoded frame, ready for a WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Binary(Bytes),
    Text(String),
}

impl Encoded {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Binary(b) => b.len(),
            Encoded::Text(t) => t.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-connection codec.
///
/// Binary input is buffered so frames split across messages still decode.
#[derive(Debug, Default)]
pub struct FrameCodec {
    format: WireFormat,
    read_buf: BytesMut,
}

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Switch the outgoing format. Used once the handshake settles it.
    pub fn set_format(&mut self, format: WireFormat) {
        self.format = format;
    }

    /// Encode a frame in this connection's format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, frame: &Frame) -> Result<Encoded, ProtocolError> {
        match self.format {
            WireFormat::Binary => encode(frame).map(Encoded::Binary),
            WireFormat::Text => encode_json(frame).map(Encoded::Text),
        }
    }

    /// Feed binary data and decode every complete frame in the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error on the first invalid frame; the buffer is cleared.
    pub fn decode_binary(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.read_buf.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match decode_from(&mut self.read_buf) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(frames),
                Err(e) => {
                    self.read_buf.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Decode a single JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid frame.
    pub fn decode_text(&self, text: &str) -> Result<Frame, ProtocolError> {
        decode_json(text)
    }

    /// Bytes buffered towards an incomplete binary frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }
}
