//! txf-test-utils: Test infrastructure for txf.
//!
//! Provides:
//! - In-memory stream pairs standing in for the remote transport
//! - FakeTerminal: scripted keystrokes and captured terminal output
//! - LoopbackPeer: an honest responder for end-to-end transfer tests
//! - DuplexTunnel: in-process side-channel transport

mod duplex_tunnel;
mod fake_terminal;
mod loopback_peer;

pub use duplex_tunnel::DuplexTunnel;
pub use fake_terminal::{FakeTerminal, OutputCapture};
pub use loopback_peer::LoopbackPeer;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

/// Halves of one end of an in-memory bidirectional stream.
pub type StreamEnd = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

/// An in-memory bidirectional stream pair: one end for the filter's
/// remote side, one for the test peer.
pub fn stream_pair() -> (StreamEnd, StreamEnd) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (tokio::io::split(a), tokio::io::split(b))
}

/// The native trigger line for the given direction character and columns,
/// as the remote wrapper would print it.
pub fn native_trigger_line(direction: char, cols: u16) -> Vec<u8> {
    format!("::TXF:TRANSFER:{direction}:1:{cols}\n").into_bytes()
}
