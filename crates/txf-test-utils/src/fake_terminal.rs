//! Fake terminal for testing without a real PTY.
//!
//! The filter's local side reads keystrokes from a pipe the test writes
//! into, and writes terminal output into a capture buffer the test can
//! inspect at any point.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};

/// A fake terminal: scripted input, captured output.
pub struct FakeTerminal {
    /// Read end handed to the filter as `local_in`.
    stdin: Option<DuplexStream>,
    /// Write end the test types keystrokes into.
    keys: DuplexStream,
    /// Shared capture behind the `local_out` writer.
    captured: Arc<Mutex<Vec<u8>>>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        let (keys, stdin) = tokio::io::duplex(4 * 1024);
        Self {
            stdin: Some(stdin),
            keys,
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The filter's `local_in`. Takeable once.
    pub fn stdin(&mut self) -> DuplexStream {
        self.stdin.take().unwrap()
    }

    /// The filter's `local_out`.
    pub fn stdout(&self) -> OutputCapture {
        OutputCapture {
            captured: Arc::clone(&self.captured),
        }
    }

    /// Type bytes as the user.
    pub async fn type_bytes(&mut self, data: &[u8]) {
        self.keys.write_all(data).await.unwrap();
        self.keys.flush().await.unwrap();
    }

    /// Close the keyboard (local EOF).
    pub async fn close_keyboard(&mut self) {
        self.keys.shutdown().await.unwrap();
    }

    /// Everything written to the terminal so far.
    pub fn output(&self) -> Vec<u8> {
        self.captured.lock().unwrap().clone()
    }

    /// Output with progress-line control sequences stripped, leaving the
    /// plain passthrough content.
    pub fn plain_output(&self) -> Vec<u8> {
        strip_overwrites(&self.output())
    }
}

impl Default for FakeTerminal {
    fn default() -> Self {
        Self::new()
    }
}

/// `AsyncWrite` into a shared byte buffer.
#[derive(Clone)]
pub struct OutputCapture {
    captured: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for OutputCapture {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.captured.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Drop every carriage-return-overwritten segment, keeping only content
/// that survived on screen. Progress lines end with `ESC [ K`; anything
/// between a bare `\r` and the erase sequence was overwritten.
fn strip_overwrites(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && data.get(i + 1) != Some(&b'\n') {
            // Find the erase-to-end-of-line that closes a progress repaint.
            if let Some(pos) = find_erase(&data[i..]) {
                i += pos;
                continue;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

fn find_erase(data: &[u8]) -> Option<usize> {
    data.windows(3)
        .position(|w| w == b"\x1b[K")
        .map(|p| p + 3)
}
