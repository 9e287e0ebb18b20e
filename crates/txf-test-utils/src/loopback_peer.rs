//! An honest remote peer for end-to-end transfer tests.
//!
//! The peer prints a trigger line the way the remote wrapper would, then
//! runs the responder role of the real session engine over its end of the
//! stream pair. Tests that need a misbehaving peer hand-drive frames with
//! the codec instead of using this type.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use txf_core::config::FilterConfig;
use txf_core::error::Result;
use txf_core::progress::TransferSummary;
use txf_core::protocol::WireFormat;
use txf_core::session::{SessionIo, TransferSession};
use txf_core::tunnel::TunnelAcceptor;

use crate::{StreamEnd, native_trigger_line};

/// A scripted remote peer running the real responder engine.
pub struct LoopbackPeer {
    config: FilterConfig,
    acceptor: Option<Arc<dyn TunnelAcceptor>>,
}

impl LoopbackPeer {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            acceptor: None,
        }
    }

    /// Offer a tunnel during negotiation.
    pub fn with_acceptor(mut self, acceptor: Arc<dyn TunnelAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Print a native trigger line announcing this peer is about to send
    /// files, then run the responder. The local filter will negotiate a
    /// download.
    pub async fn send_files(&self, end: &mut StreamEnd, cols: u16) -> Result<TransferSummary> {
        self.trigger_and_respond(end, 'S', cols).await
    }

    /// Print a native trigger line announcing this peer is waiting to
    /// receive files, then run the responder. The local filter will
    /// negotiate an upload.
    pub async fn recv_files(&self, end: &mut StreamEnd, cols: u16) -> Result<TransferSummary> {
        self.trigger_and_respond(end, 'R', cols).await
    }

    /// Print the legacy send marker, then respond over the legacy line
    /// protocol.
    pub async fn send_files_legacy(&self, end: &mut StreamEnd) -> Result<TransferSummary> {
        let (reader, writer) = end;
        writer
            .write_all(format!("{}\n", txf_core::constants::LEGACY_SEND_MARKER).as_bytes())
            .await?;
        writer.flush().await?;

        let io = SessionIo::new(reader, writer, WireFormat::Legacy);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut session = TransferSession::new(io, &self.config, cancel);
        session.respond().await
    }

    async fn trigger_and_respond(
        &self,
        end: &mut StreamEnd,
        direction: char,
        cols: u16,
    ) -> Result<TransferSummary> {
        let (reader, writer) = end;
        writer.write_all(&native_trigger_line(direction, cols)).await?;
        writer.flush().await?;
        debug!(%direction, "trigger printed, running responder");

        let io = SessionIo::new(reader, writer, WireFormat::Native);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut session = TransferSession::new(io, &self.config, cancel);
        if let Some(acceptor) = &self.acceptor {
            session = session.with_acceptor(Arc::clone(acceptor));
        }
        session.respond().await
    }
}
