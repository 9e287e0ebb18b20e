//! Wire codecs for protocol messages.
//!
//! Native format: 4-byte little-endian length prefix + bincode-encoded
//! [`Message`]. Legacy format: one `#F:<base64(bincode)>\n` line per frame,
//! tolerant of a CR before the LF (the frames cross a pty).
//!
//! Both decoders:
//! - return `Ok(None)` on partial input to support streaming
//! - consume the buffer only on successful decode
//! - reject oversized frames before waiting for more data

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Length of the native frame header (4 bytes, little-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// Prefix of a legacy frame line.
const LEGACY_LINE_PREFIX: &[u8] = b"#F:";

/// Codec for length-prefixed bincode encoding of messages.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a message to bytes with length prefix.
    pub fn encode(msg: &Message) -> Result<Bytes> {
        let payload = bincode::serialize(msg).map_err(|e| Error::Codec {
            message: format!("serialization failed: {}", e),
        })?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::Codec {
                message: format!(
                    "frame too large: {} bytes (max {})",
                    payload.len(),
                    MAX_FRAME_SIZE
                ),
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from a buffer.
    ///
    /// Returns:
    /// - Ok(Some(msg)) if a complete message was decoded (buffer is advanced)
    /// - Ok(None) if more data is needed (buffer unchanged)
    /// - Err if the data is invalid
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // Peek the length without consuming
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(Error::Codec {
                message: format!("frame length {} exceeds maximum {}", len, MAX_FRAME_SIZE),
            });
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(len);
        let msg = bincode::deserialize(&payload).map_err(|e| Error::Codec {
            message: format!("deserialization failed: {}", e),
        })?;

        Ok(Some(msg))
    }
}

/// Codec for the legacy line protocol.
pub struct LegacyCodec;

impl LegacyCodec {
    /// Encode a message as a single base64 line.
    pub fn encode(msg: &Message) -> Result<Bytes> {
        let payload = bincode::serialize(msg).map_err(|e| Error::Codec {
            message: format!("serialization failed: {}", e),
        })?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::Codec {
                message: format!(
                    "frame too large: {} bytes (max {})",
                    payload.len(),
                    MAX_FRAME_SIZE
                ),
            });
        }

        let encoded = BASE64.encode(&payload);
        let mut buf = BytesMut::with_capacity(LEGACY_LINE_PREFIX.len() + encoded.len() + 1);
        buf.put_slice(LEGACY_LINE_PREFIX);
        buf.put_slice(encoded.as_bytes());
        buf.put_u8(b'\n');

        Ok(buf.freeze())
    }

    /// Decode a message from a buffer of line frames.
    ///
    /// Same contract as [`FrameCodec::decode`]. Bytes between frames that
    /// do not form a valid frame line are a codec error: once a session is
    /// active, everything on the stream belongs to the protocol.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
        // Bound the search: a base64 line for a max-size frame
        let max_line = MAX_FRAME_SIZE / 3 * 4 + 16;

        let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > max_line {
                return Err(Error::Codec {
                    message: "legacy frame line exceeds maximum length".into(),
                });
            }
            return Ok(None);
        };

        let line = buf.split_to(newline + 1);
        let mut line = &line[..newline];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        let Some(b64) = line.strip_prefix(LEGACY_LINE_PREFIX) else {
            return Err(Error::Codec {
                message: "legacy frame missing line prefix".into(),
            });
        };

        let payload = BASE64.decode(b64).map_err(|e| Error::Codec {
            message: format!("base64 decode failed: {}", e),
        })?;

        let msg = bincode::deserialize(&payload).map_err(|e| Error::Codec {
            message: format!("deserialization failed: {}", e),
        })?;

        Ok(Some(msg))
    }
}

/// Wire format selected at negotiation time, dispatching to the
/// variant-specific codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Length-prefixed binary frames.
    Native,
    /// Base64 line frames.
    Legacy,
}

impl WireFormat {
    /// Encode a message in this wire format.
    pub fn encode(&self, msg: &Message) -> Result<Bytes> {
        match self {
            WireFormat::Native => FrameCodec::encode(msg),
            WireFormat::Legacy => LegacyCodec::encode(msg),
        }
    }

    /// Decode a message in this wire format.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match self {
            WireFormat::Native => FrameCodec::decode(buf),
            WireFormat::Legacy => LegacyCodec::decode(buf),
        }
    }
}
