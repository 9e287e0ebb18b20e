//! Session lifecycle state and external commands.

use std::path::PathBuf;

use crate::config::FilterConfig;
use crate::error::{Error, Result};

/// Lifecycle of one transfer session.
///
/// The relay loop owns the state and tags its behavior on it; there is no
/// per-state dispatch object. Every path out of a session passes through
/// `Finishing` or `Aborted` before the filter returns to `Idle`, so the
/// terminal stream is never left mid-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Transparent passthrough; the detector watches for markers.
    #[default]
    Idle,
    /// Trigger seen, handshake in flight.
    Negotiating,
    /// Chunks moving in the negotiated direction.
    Transferring,
    /// Closing handshake in flight.
    Finishing,
    /// Session torn down after a fatal error; drains back to `Idle`.
    Aborted,
}

impl SessionState {
    /// Whether the stream currently carries protocol frames rather than
    /// terminal bytes.
    pub fn in_session(self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    /// Validate an expected state, for transitions that are only legal
    /// from one place.
    pub fn expect(self, expected: SessionState) -> Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: format!("{expected:?}"),
                actual: format!("{self:?}"),
            })
        }
    }
}

/// Commands accepted by the filter from the embedding application.
#[derive(Debug)]
pub enum SessionCommand {
    /// Queue local paths for upload at the next opportunity.
    Upload(Vec<PathBuf>),
    /// Cancel the active session, if any.
    Cancel,
    /// Replace the filter configuration; consumed at the next negotiation.
    SetOptions(Box<FilterConfig>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_is_not_in_session() {
        assert!(!SessionState::Idle.in_session());
        assert!(SessionState::Negotiating.in_session());
        assert!(SessionState::Transferring.in_session());
        assert!(SessionState::Finishing.in_session());
        assert!(SessionState::Aborted.in_session());
    }

    #[test]
    fn expect_rejects_wrong_state() {
        assert!(SessionState::Idle.expect(SessionState::Idle).is_ok());
        let err = SessionState::Idle
            .expect(SessionState::Transferring)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
