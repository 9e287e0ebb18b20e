//! Shared protocol enums.

use serde::{Deserialize, Serialize};

/// Protocol variant selected by the trigger marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// Rich framed protocol with per-chunk acknowledgments.
    Native,
    /// Line-oriented protocol compatible with the legacy peer. Chunks are
    /// assumed delivered without acknowledgment.
    Legacy,
}

/// Transfer direction from the local side's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Local files are sent to the peer.
    Upload,
    /// Files from the peer are written locally.
    Download,
}

impl TransferDirection {
    /// The same transfer as seen by the other end of the stream.
    pub fn flipped(self) -> Self {
        match self {
            TransferDirection::Upload => TransferDirection::Download,
            TransferDirection::Download => TransferDirection::Upload,
        }
    }
}

/// Feature flags exchanged during the hello handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features {
    /// Peer can decompress zstd chunk payloads.
    pub compress: bool,
    /// Peer can accept a side-channel tunnel connection.
    pub tunnel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flip() {
        assert_eq!(TransferDirection::Upload.flipped(), TransferDirection::Download);
        assert_eq!(TransferDirection::Download.flipped(), TransferDirection::Upload);
    }
}
