//! Wire protocol for the embedded transfer session.
//!
//! This module provides:
//! - Message types and payloads
//! - Native (length-prefixed bincode) and legacy (base64 line) codecs
//! - Chunk construction and verification

mod chunk;
mod codec;
mod message;
mod types;

pub use chunk::{chunk_size_for_cols, make_chunk, verify_chunk};
pub use codec::{FRAME_HEADER_LEN, FrameCodec, LegacyCodec, WireFormat};
pub use message::*;
pub use types::{Features, ProtocolVariant, TransferDirection};

impl ProtocolVariant {
    /// The wire format this variant frames messages with.
    pub fn wire_format(self) -> WireFormat {
        match self {
            ProtocolVariant::Native => WireFormat::Native,
            ProtocolVariant::Legacy => WireFormat::Legacy,
        }
    }

    /// Whether chunks are individually acknowledged.
    pub fn acknowledged(self) -> bool {
        matches!(self, ProtocolVariant::Native)
    }
}
