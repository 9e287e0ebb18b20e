//! Side-channel tunnel for bulk data frames.
//!
//! When both peers support it, chunk data moves over a dedicated duplex
//! stream instead of the primary terminal channel, keeping the terminal
//! responsive during large transfers. The tunnel carries only framed
//! protocol messages; control traffic stays on the primary channel. A
//! tunnel that fails to open or dies mid-transfer downgrades the session
//! to inline delivery rather than aborting it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Combined read/write bound for tunnel streams.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Opens the side channel to the peer, initiator side.
///
/// The transport is supplied by the embedding application (an extra ssh
/// channel, a TCP connection, an in-process duplex pipe in tests); the
/// session only requires an ordered reliable byte stream.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Establish the side channel to the port the peer advertised.
    ///
    /// Failures are reported as [`Error::Transport`](crate::Error::Transport)
    /// and downgrade the session to inline delivery.
    async fn connect(&self, port: u16) -> Result<Box<dyn TunnelStream>>;
}

/// Accepts the side channel, responder side.
#[async_trait]
pub trait TunnelAcceptor: Send + Sync {
    /// Port advertised to the initiator during the hello handshake.
    fn port(&self) -> u16;

    /// Wait for the initiator's connection.
    async fn accept(&self) -> Result<Box<dyn TunnelStream>>;
}

/// Byte counters for a tunnel, shared between the relay loop and the
/// transfer engine.
#[derive(Debug, Default)]
pub struct TunnelStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}
