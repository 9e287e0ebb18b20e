//! Terminal size access and resize coordination.
//!
//! The filter never touches the terminal itself; the embedding program
//! supplies a [`SizeSource`] and forwards resize notifications to a
//! [`ResizeCoordinator`]. The coordinator is the only writer of the
//! column-width value; readers hold cheap `watch` receivers and tolerate
//! staleness by one resize event.

use tokio::sync::watch;
use tracing::debug;

use crate::constants::{DEFAULT_COLS, DEFAULT_ROWS, MAX_TERMINAL_COLS};
use crate::error::Result;

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    /// Columns.
    pub cols: u16,
    /// Rows.
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Source of the current terminal size. The query may fail; callers fall
/// back to [`TermSize::default`].
pub trait SizeSource: Send + Sync {
    /// Query the current terminal size.
    fn size(&self) -> Result<TermSize>;
}

/// A size source returning a fixed value, for tests and headless use.
#[derive(Debug, Clone, Copy)]
pub struct FixedSize(pub TermSize);

impl SizeSource for FixedSize {
    fn size(&self) -> Result<TermSize> {
        Ok(self.0)
    }
}

/// Single writer of the shared column-width value.
#[derive(Debug)]
pub struct ResizeCoordinator {
    tx: watch::Sender<u16>,
}

impl ResizeCoordinator {
    /// Create a coordinator with an initial column count.
    pub fn new(cols: u16) -> Self {
        let (tx, _) = watch::channel(clamp_cols(cols));
        Self { tx }
    }

    /// Create a coordinator seeded from a size source, falling back to the
    /// default width if the query fails.
    pub fn from_source(source: &dyn SizeSource) -> Self {
        let cols = source.size().map(|s| s.cols).unwrap_or(DEFAULT_COLS);
        Self::new(cols)
    }

    /// Subscribe to column-width updates.
    pub fn subscribe(&self) -> watch::Receiver<u16> {
        self.tx.subscribe()
    }

    /// Publish a new terminal size. Atomic single-value replacement;
    /// readers never observe a torn value.
    pub fn update(&self, size: TermSize) {
        let cols = clamp_cols(size.cols);
        if self.tx.send_replace(cols) != cols {
            debug!(cols, "terminal width changed");
        }
    }

    /// Current column count.
    pub fn cols(&self) -> u16 {
        *self.tx.borrow()
    }
}

fn clamp_cols(cols: u16) -> u16 {
    if cols == 0 {
        DEFAULT_COLS
    } else {
        cols.min(MAX_TERMINAL_COLS)
    }
}

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Where the gate is inside an escape sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    /// Ordinary terminal bytes.
    Plain,
    /// Saw ESC, next byte decides.
    Esc,
    /// Inside `ESC ]`, matching the prefix bytes collected so far
    /// against the clipboard selector.
    OscPrefix(Vec<u8>),
    /// Inside a clipboard write; drop until the terminator.
    Swallow,
    /// Saw ESC inside a swallowed sequence; `\` ends it.
    SwallowEsc,
}

/// Drops OSC 52 clipboard writes from a terminal stream when the
/// embedding program disallows them; every other byte passes unmodified.
/// Sequences may split across reads, so the gate keeps its scan state
/// between calls.
#[derive(Debug)]
pub struct ClipboardGate {
    allow: bool,
    state: GateState,
}

impl ClipboardGate {
    const SELECTOR: &'static [u8] = b"52;";

    /// `allow` passes clipboard sequences through untouched.
    pub fn new(allow: bool) -> Self {
        Self {
            allow,
            state: GateState::Plain,
        }
    }

    /// Filter one read's worth of output bytes.
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        if self.allow {
            return data.to_vec();
        }
        let mut out = Vec::with_capacity(data.len());
        for &b in data {
            self.step(b, &mut out);
        }
        out
    }

    fn step(&mut self, b: u8, out: &mut Vec<u8>) {
        match std::mem::replace(&mut self.state, GateState::Plain) {
            GateState::Plain => {
                if b == ESC {
                    self.state = GateState::Esc;
                } else {
                    out.push(b);
                }
            }
            GateState::Esc => {
                if b == b']' {
                    self.state = GateState::OscPrefix(Vec::new());
                } else {
                    out.push(ESC);
                    self.step(b, out);
                }
            }
            GateState::OscPrefix(mut prefix) => {
                if b == Self::SELECTOR[prefix.len()] {
                    prefix.push(b);
                    self.state = if prefix.len() == Self::SELECTOR.len() {
                        GateState::Swallow
                    } else {
                        GateState::OscPrefix(prefix)
                    };
                } else {
                    // Some other OSC sequence; replay what was held.
                    out.push(ESC);
                    out.push(b']');
                    out.extend_from_slice(&prefix);
                    self.step(b, out);
                }
            }
            GateState::Swallow => {
                self.state = match b {
                    BEL => GateState::Plain,
                    ESC => GateState::SwallowEsc,
                    _ => GateState::Swallow,
                };
            }
            GateState::SwallowEsc => {
                self.state = if b == b'\\' {
                    GateState::Plain
                } else {
                    GateState::Swallow
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_source_reports_size() {
        let source = FixedSize(TermSize { cols: 132, rows: 50 });
        assert_eq!(source.size().unwrap().cols, 132);
    }

    #[test]
    fn coordinator_updates_subscribers() {
        let coordinator = ResizeCoordinator::new(80);
        let rx = coordinator.subscribe();
        assert_eq!(*rx.borrow(), 80);

        coordinator.update(TermSize { cols: 120, rows: 40 });
        assert_eq!(*rx.borrow(), 120);
        assert_eq!(coordinator.cols(), 120);
    }

    #[test]
    fn zero_width_falls_back_to_default() {
        let coordinator = ResizeCoordinator::new(0);
        assert_eq!(coordinator.cols(), DEFAULT_COLS);

        coordinator.update(TermSize { cols: 0, rows: 24 });
        assert_eq!(coordinator.cols(), DEFAULT_COLS);
    }

    #[test]
    fn width_is_clamped() {
        let coordinator = ResizeCoordinator::new(9999);
        assert_eq!(coordinator.cols(), MAX_TERMINAL_COLS);
    }

    #[test]
    fn gate_allows_by_default() {
        let mut gate = ClipboardGate::new(true);
        let input = b"text \x1b]52;c;aGVsbG8=\x07 more";
        assert_eq!(gate.feed(input), input);
    }

    #[test]
    fn gate_drops_clipboard_writes() {
        let mut gate = ClipboardGate::new(false);
        assert_eq!(gate.feed(b"a\x1b]52;c;aGVsbG8=\x07b"), b"ab");
        // ST-terminated form
        assert_eq!(gate.feed(b"x\x1b]52;p;Zm9v\x1b\\y"), b"xy");
    }

    #[test]
    fn gate_passes_other_sequences() {
        let mut gate = ClipboardGate::new(false);
        let title = b"\x1b]0;my title\x07";
        assert_eq!(gate.feed(title), title);
        let cursor = b"\x1b[2Jplain";
        assert_eq!(gate.feed(cursor), cursor);
    }

    #[test]
    fn gate_handles_sequence_split_across_reads() {
        let mut gate = ClipboardGate::new(false);
        let mut out = gate.feed(b"before\x1b]5");
        out.extend_from_slice(&gate.feed(b"2;c;aGk=\x07after"));
        assert_eq!(out, b"beforeafter");

        // A split that turns out not to be a clipboard write
        let mut out = gate.feed(b"\x1b]5");
        out.extend_from_slice(&gate.feed(b"0;x\x07tail"));
        assert_eq!(out, b"\x1b]50;x\x07tail");
    }
}
