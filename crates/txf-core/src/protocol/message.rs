//! Wire message definitions for the embedded transfer protocol.
//!
//! All messages travel as frames produced by [`super::codec`]: the native
//! variant uses length-prefixed bincode, the legacy variant wraps the same
//! encoding in base64 lines. Control messages and acknowledgments always
//! travel on the primary stream; `Data` frames may be diverted to a
//! side-channel tunnel.

use serde::{Deserialize, Serialize};

use crate::config::TransferConfig;
use crate::manifest::ManifestEntry;
use crate::protocol::Features;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Initiator greeting, first frame of every session.
    Hello(HelloPayload),
    /// Responder reply to `Hello`.
    HelloAck(HelloAckPayload),
    /// Negotiated session configuration, sent by the initiator.
    Config(TransferConfig),
    /// Peer confirmation of the configuration.
    ConfigAck,
    /// Ordered list of entries for this transfer batch.
    Manifest(ManifestPayload),
    /// Peer confirmation that the manifest was accepted.
    ManifestAck,
    /// Opens manifest entry `index` for data transfer.
    EntryOpen(EntryOpenPayload),
    /// One chunk of the current entry's payload.
    Data(ChunkPayload),
    /// Receiver acknowledgment of a chunk (native variant only).
    Ack(AckPayload),
    /// Receiver rejection of a chunk; the sender retries that chunk.
    Nak(NakPayload),
    /// Sender announcement that the current entry is complete.
    EntryDone(EntryDonePayload),
    /// Receiver verdict after verifying the whole entry.
    EntryOk { index: u32 },
    /// Either side abandoning the current entry; the session continues.
    EntryFail(EntryFailPayload),
    /// Sender skipping an entry it could not read.
    EntrySkip(EntryFailPayload),
    /// Request to move bulk data onto the tunnel connected to `port`.
    TunnelOpen { port: u16 },
    /// Peer verdict on the tunnel request.
    TunnelAck { accepted: bool },
    /// Sender fallback notice: remaining chunks arrive on the primary stream.
    TunnelDown,
    /// Closing control message after the last manifest entry.
    Finish(FinishPayload),
    /// Final acknowledgment; the session returns to passthrough.
    FinishAck,
    /// Orderly session abort.
    Abort { reason: String },
}

/// Initiator greeting payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Highest protocol version the initiator speaks.
    pub version: u8,
    /// Initiator feature flags.
    pub features: Features,
}

/// Responder reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    /// Version the responder selected.
    pub version: u8,
    /// Whether the responder accepts the session.
    pub accepted: bool,
    /// Reason when `accepted` is false.
    pub reject_reason: Option<String>,
    /// Responder feature flags.
    pub features: Features,
    /// Port the responder listens on for a tunnel, when supported.
    pub tunnel_port: Option<u16>,
}

/// Manifest announcement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPayload {
    /// Ordered entries; directories precede their contents.
    pub entries: Vec<ManifestEntry>,
    /// Sum of all regular-file sizes.
    pub total_bytes: u64,
}

/// Entry-open payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryOpenPayload {
    /// Index into the manifest.
    pub index: u32,
}

/// One chunk of file payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Monotonic sequence number, starting at 0 per entry.
    pub seq: u64,
    /// xxHash64 of the (possibly compressed) payload bytes.
    pub checksum: u64,
    /// Whether the payload bytes are zstd-compressed.
    pub compressed: bool,
    /// Whether this is the final chunk of the entry.
    pub last: bool,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// Chunk acknowledgment payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Sequence number being acknowledged.
    pub seq: u64,
}

/// Chunk rejection payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NakPayload {
    /// Sequence number being rejected.
    pub seq: u64,
    /// Human-readable reason, surfaced in logs.
    pub reason: String,
}

/// Entry completion payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDonePayload {
    /// Index into the manifest.
    pub index: u32,
    /// Whole-file xxHash64 of the uncompressed content.
    pub checksum: u64,
    /// Total uncompressed size in bytes.
    pub size: u64,
}

/// Entry failure/skip payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFailPayload {
    /// Index into the manifest.
    pub index: u32,
    /// Human-readable reason.
    pub reason: String,
}

/// Session summary exchanged in the closing handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinishPayload {
    /// Entries transferred successfully.
    pub files_ok: u64,
    /// Entries abandoned after errors.
    pub files_failed: u64,
    /// Entries skipped before transfer.
    pub files_skipped: u64,
    /// Total payload bytes delivered.
    pub bytes: u64,
}

impl Message {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::HelloAck(_) => "HelloAck",
            Message::Config(_) => "Config",
            Message::ConfigAck => "ConfigAck",
            Message::Manifest(_) => "Manifest",
            Message::ManifestAck => "ManifestAck",
            Message::EntryOpen(_) => "EntryOpen",
            Message::Data(_) => "Data",
            Message::Ack(_) => "Ack",
            Message::Nak(_) => "Nak",
            Message::EntryDone(_) => "EntryDone",
            Message::EntryOk { .. } => "EntryOk",
            Message::EntryFail(_) => "EntryFail",
            Message::EntrySkip(_) => "EntrySkip",
            Message::TunnelOpen { .. } => "TunnelOpen",
            Message::TunnelAck { .. } => "TunnelAck",
            Message::TunnelDown => "TunnelDown",
            Message::Finish(_) => "Finish",
            Message::FinishAck => "FinishAck",
            Message::Abort { .. } => "Abort",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names() {
        assert_eq!(Message::ConfigAck.name(), "ConfigAck");
        assert_eq!(Message::TunnelDown.name(), "TunnelDown");
        assert_eq!(
            Message::Abort {
                reason: "x".into()
            }
            .name(),
            "Abort"
        );
    }
}
