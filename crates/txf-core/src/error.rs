//! Error types for txf-core.

use thiserror::Error;

/// Main error type for filter and transfer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or unexpected frame.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during frame encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Negotiation with the peer failed.
    #[error("negotiation failed: {message}")]
    Negotiate { message: String },

    /// Chunk checksum mismatch that exhausted the retry budget.
    #[error("chunk {seq} checksum mismatch after retries")]
    ChunkChecksum { seq: u64 },

    /// Underlying stream closed or broken.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Stream was closed by the peer.
    #[error("stream closed")]
    StreamClosed,

    /// Manifest path escapes the destination directory.
    #[error("path escapes destination: {0}")]
    PathEscape(String),

    /// Per-entry file transfer failure.
    #[error("file transfer error: {message}")]
    FileTransfer { message: String },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Transfer cancelled by the user.
    #[error("transfer cancelled")]
    Cancelled,

    /// A transfer session is already active.
    #[error("transfer session already active")]
    SessionBusy,

    /// Invalid session state transition.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl Error {
    /// Returns true if this error aborts the whole session.
    ///
    /// Session-fatal errors mean the borrowed stream can no longer carry
    /// protocol framing: the session transitions to Aborted and passthrough
    /// resumes (or the relay terminates for transport errors).
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::StreamClosed
                | Error::Protocol { .. }
                | Error::Codec { .. }
                | Error::Negotiate { .. }
                | Error::Timeout
                | Error::Cancelled
                | Error::Io(_)
        )
    }

    /// Returns true if this error affects a single manifest entry only.
    ///
    /// Entry-level errors skip the current entry and the session continues
    /// with the next one.
    pub fn is_entry_level(&self) -> bool {
        matches!(
            self,
            Error::ChunkChecksum { .. } | Error::PathEscape(_) | Error::FileTransfer { .. }
        )
    }
}

/// Convenience result type for txf operations.
pub type Result<T> = std::result::Result<T, Error>;
