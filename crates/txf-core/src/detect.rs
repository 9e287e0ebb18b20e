//! Inline trigger detection on a one-directional byte stream.
//!
//! The detector turns raw bytes into a sequence of [`DetectEvent`]s:
//! plain segments are forwarded unmodified, trigger markers are swallowed
//! and reported. Markers match whole lines only, never substrings, so
//! ordinary command output echoing a marker mid-line passes through.
//!
//! Latency discipline: bytes are buffered only while the current line is
//! still a viable prefix of a marker. A prompt with no trailing newline is
//! flushed immediately; a marker split across reads is still recognized.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::constants::{
    LEGACY_RECV_MARKER, LEGACY_SEND_MARKER, MAX_TRIGGER_LINE, NATIVE_MARKER_PREFIX,
};
use crate::protocol::{ProtocolVariant, TransferDirection};

/// A recognized transfer trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Protocol variant announced by the marker.
    pub variant: ProtocolVariant,
    /// Transfer direction from the local side's perspective.
    pub direction: TransferDirection,
    /// Protocol version from the marker line (native only).
    pub version: Option<u8>,
    /// Peer terminal columns from the marker line (native only).
    pub cols: Option<u16>,
}

/// Output of the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectEvent {
    /// Ordinary bytes, forwarded unmodified and in order.
    Plain(Bytes),
    /// A swallowed trigger line.
    Trigger(Trigger),
}

/// Streaming trigger detector for one direction of a stream.
#[derive(Debug, Default)]
pub struct TriggerDetector {
    /// Held bytes of the current line while it may still be a marker.
    line: BytesMut,
    /// Whether the current line can still become a marker.
    dead_line: bool,
    /// Set once a trigger fired; later input is residual protocol bytes.
    triggered: bool,
    /// Bytes received after the marker line, owed to the session.
    residual: BytesMut,
}

impl TriggerDetector {
    /// Create a new detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed input bytes, producing detection events.
    ///
    /// After a `Trigger` event no further events are produced; remaining
    /// bytes accumulate as residual until [`take_residual`] and [`reset`]
    /// are called.
    ///
    /// [`take_residual`]: Self::take_residual
    /// [`reset`]: Self::reset
    pub fn feed(&mut self, input: &[u8]) -> Vec<DetectEvent> {
        let mut events = Vec::new();

        if self.triggered {
            self.residual.extend_from_slice(input);
            return events;
        }

        let mut plain = BytesMut::new();

        for (idx, &byte) in input.iter().enumerate() {
            if byte == b'\n' {
                if !self.dead_line && !self.line.is_empty() {
                    if let Some(trigger) = match_marker(strip_cr(&self.line)) {
                        trace!(?trigger, "trigger marker detected");
                        if !plain.is_empty() {
                            events.push(DetectEvent::Plain(plain.freeze()));
                        }
                        events.push(DetectEvent::Trigger(trigger));
                        self.line.clear();
                        self.triggered = true;
                        self.residual.extend_from_slice(&input[idx + 1..]);
                        return events;
                    }
                    plain.extend_from_slice(&self.line);
                    self.line.clear();
                }
                plain.put_u8(b'\n');
                self.dead_line = false;
            } else if self.dead_line {
                plain.put_u8(byte);
            } else {
                self.line.put_u8(byte);
                if !viable_prefix(&self.line) {
                    plain.extend_from_slice(&self.line);
                    self.line.clear();
                    self.dead_line = true;
                }
            }
        }

        if !plain.is_empty() {
            events.push(DetectEvent::Plain(plain.freeze()));
        }
        events
    }

    /// Flush at end of stream. A complete marker with no trailing newline
    /// still fires; anything else becomes a plain segment.
    pub fn finish(&mut self) -> Vec<DetectEvent> {
        if self.triggered || self.line.is_empty() {
            return Vec::new();
        }

        let line = self.line.split();
        if !self.dead_line
            && let Some(trigger) = match_marker(strip_cr(&line))
        {
            self.triggered = true;
            return vec![DetectEvent::Trigger(trigger)];
        }
        vec![DetectEvent::Plain(line.freeze())]
    }

    /// Take bytes received after the trigger line; they belong to the
    /// protocol framing, not to passthrough.
    pub fn take_residual(&mut self) -> Bytes {
        self.residual.split().freeze()
    }

    /// Take the partially accumulated line as plain bytes. Used when the
    /// stream is handed over because the *other* direction fired: the held
    /// prefix never completed into a marker and belongs to passthrough.
    pub fn take_held(&mut self) -> Bytes {
        self.dead_line = false;
        self.line.split().freeze()
    }

    /// Reset after a session ends so detection resumes cleanly.
    pub fn reset(&mut self) {
        self.line.clear();
        self.residual.clear();
        self.dead_line = false;
        self.triggered = false;
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Whether the held line could still turn into a marker line.
fn viable_prefix(line: &[u8]) -> bool {
    if line.len() > MAX_TRIGGER_LINE {
        return false;
    }

    // A carriage return is only valid directly before the newline, so at
    // this point the body must already be a complete marker.
    if line.last() == Some(&b'\r') {
        return match_marker(strip_cr(line)).is_some();
    }

    if line.len() >= NATIVE_MARKER_PREFIX.len() {
        if line.starts_with(NATIVE_MARKER_PREFIX.as_bytes()) {
            return true;
        }
    } else if NATIVE_MARKER_PREFIX.as_bytes().starts_with(line) {
        return true;
    }

    LEGACY_SEND_MARKER.as_bytes().starts_with(line)
        || LEGACY_RECV_MARKER.as_bytes().starts_with(line)
}

/// Match a complete line (newline and CR stripped) against the marker set.
///
/// Native markers take precedence over legacy ones: they carry a version
/// field and are strictly more specific.
fn match_marker(line: &[u8]) -> Option<Trigger> {
    let text = std::str::from_utf8(line).ok()?;

    if let Some(params) = text.strip_prefix(NATIVE_MARKER_PREFIX) {
        return parse_native_params(params);
    }

    if text == LEGACY_SEND_MARKER {
        return Some(Trigger {
            variant: ProtocolVariant::Legacy,
            direction: TransferDirection::Download,
            version: None,
            cols: None,
        });
    }
    if text == LEGACY_RECV_MARKER {
        return Some(Trigger {
            variant: ProtocolVariant::Legacy,
            direction: TransferDirection::Upload,
            version: None,
            cols: None,
        });
    }

    None
}

/// Parse `<S|R>:<version>:<cols>` after the native prefix. A malformed
/// parameter list is a detection error, absorbed by treating the line as
/// plain content.
fn parse_native_params(params: &str) -> Option<Trigger> {
    let mut fields = params.split(':');
    let dir = fields.next()?;
    let version = fields.next()?.parse::<u8>().ok()?;
    let cols = fields.next()?.parse::<u16>().ok()?;
    if fields.next().is_some() {
        return None;
    }

    // S = peer sends (local downloads), R = peer receives (local uploads)
    let direction = match dir {
        "S" => TransferDirection::Download,
        "R" => TransferDirection::Upload,
        _ => return None,
    };

    Some(Trigger {
        variant: ProtocolVariant::Native,
        direction,
        version: Some(version),
        cols: Some(cols),
    })
}
