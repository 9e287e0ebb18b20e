//! Transfer session engine: negotiation, entry streaming, and the closing
//! handshake.
//!
//! One session owns the stream from the moment a trigger fires until the
//! final acknowledgment. The local filter is always the initiator (sends
//! `Hello` first) regardless of which side announced the trigger; the
//! remote wrapper runs the responder role. Both engines live here because
//! the responder is the initiator's mirror image, and the test peer reuses
//! it verbatim.
//!
//! Control messages and acknowledgments always travel on the primary
//! stream. `Data` frames are diverted to the side-channel tunnel when one
//! was negotiated; the tunnel always uses native framing, and losing it
//! mid-transfer downgrades to inline delivery instead of aborting.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::checksum::StreamingHasher;
use crate::compress::{Compressor, Decompressor, is_compressed_extension};
use crate::config::{FilterConfig, TransferConfig};
use crate::constants::{
    CHUNK_SIZE, CONTROL_TIMEOUT, FINISH_GRACE, MAX_CHUNK_RETRIES, PROTOCOL_VERSION,
};
use crate::detect::Trigger;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestEntry, resolve_dest};
use crate::progress::{ProgressLine, ProgressSnapshot, TransferSummary};
use crate::protocol::{
    AckPayload, ChunkPayload, EntryDonePayload, EntryFailPayload, EntryOpenPayload, Features,
    FinishPayload, HelloAckPayload, HelloPayload, ManifestPayload, Message, NakPayload,
    ProtocolVariant, TransferDirection, WireFormat, chunk_size_for_cols, make_chunk, verify_chunk,
};
use crate::session::SessionState;
use crate::tunnel::{TunnelAcceptor, TunnelConnector, TunnelStats, TunnelStream};

/// Suffix for in-flight destination files. The final name appears only
/// after the whole-file checksum verified.
const PARTIAL_SUFFIX: &str = ".txf.partial";

// =============================================================================
// Session I/O
// =============================================================================

/// Framed message I/O over the primary stream.
///
/// Reads land in an owned buffer before decoding, so a `recv` future
/// dropped by `select!` loses no bytes.
pub struct SessionIo<'a> {
    reader: &'a mut (dyn AsyncRead + Unpin + Send),
    writer: &'a mut (dyn AsyncWrite + Unpin + Send),
    wire: WireFormat,
    rbuf: BytesMut,
}

impl<'a> SessionIo<'a> {
    /// Wrap the primary stream halves.
    pub fn new(
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        writer: &'a mut (dyn AsyncWrite + Unpin + Send),
        wire: WireFormat,
    ) -> Self {
        Self {
            reader,
            writer,
            wire,
            rbuf: BytesMut::new(),
        }
    }

    /// Seed the read buffer with bytes that arrived in the same read as
    /// the trigger marker; they are the first frames of the session.
    pub fn push_residual(&mut self, residual: Bytes) {
        self.rbuf.extend_from_slice(&residual);
    }

    /// Encode and send one message on the primary stream.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        trace!(msg = msg.name(), "send");
        let frame = self.wire.encode(msg)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next message from the primary stream.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.wire.decode(&mut self.rbuf)? {
                trace!(msg = msg.name(), "recv");
                return Ok(msg);
            }
            let n = self.reader.read_buf(&mut self.rbuf).await?;
            if n == 0 {
                return Err(Error::StreamClosed);
            }
        }
    }

    /// Receive with the control-message deadline. Chunk acknowledgments
    /// are not subject to this timeout.
    pub async fn recv_control(&mut self) -> Result<Message> {
        match timeout(CONTROL_TIMEOUT, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// Framed message I/O over the side-channel tunnel. Always native framing.
struct TunnelIo {
    stream: Box<dyn TunnelStream>,
    rbuf: BytesMut,
    stats: Arc<TunnelStats>,
}

impl TunnelIo {
    fn new(stream: Box<dyn TunnelStream>, stats: Arc<TunnelStats>) -> Self {
        Self {
            stream,
            rbuf: BytesMut::new(),
            stats,
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = WireFormat::Native.encode(msg)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.stats.add_sent(frame.len() as u64);
        Ok(())
    }
}

// =============================================================================
// Transfer session
// =============================================================================

/// A single transfer session over a taken-over terminal stream.
pub struct TransferSession<'a> {
    io: SessionIo<'a>,
    filter: &'a FilterConfig,
    cancel: Arc<AtomicBool>,
    cols: watch::Receiver<u16>,
    tunnel: Option<TunnelIo>,
    tunnel_stats: Arc<TunnelStats>,
    connector: Option<Arc<dyn TunnelConnector>>,
    acceptor: Option<Arc<dyn TunnelAcceptor>>,
    /// Progress sink, the local terminal. Absent on the responder side.
    term: Option<&'a mut (dyn AsyncWrite + Unpin + Send)>,
    progress: ProgressLine,
    started: Instant,
    state: SessionState,
}

impl<'a> TransferSession<'a> {
    /// Build a session around the primary stream halves.
    pub fn new(io: SessionIo<'a>, filter: &'a FilterConfig, cancel: Arc<AtomicBool>) -> Self {
        let (_, cols) = watch::channel(filter.cols);
        let progress = ProgressLine::new(filter.progress_colors);
        Self {
            io,
            filter,
            cancel,
            cols,
            tunnel: None,
            tunnel_stats: TunnelStats::new(),
            connector: None,
            acceptor: None,
            term: None,
            progress,
            started: Instant::now(),
            state: SessionState::Idle,
        }
    }

    /// Follow live terminal resizes instead of a fixed width.
    pub fn with_cols(mut self, cols: watch::Receiver<u16>) -> Self {
        self.cols = cols;
        self
    }

    /// Render progress to the given terminal writer.
    pub fn with_terminal(mut self, term: &'a mut (dyn AsyncWrite + Unpin + Send)) -> Self {
        self.term = Some(term);
        self
    }

    /// Allow opening a side-channel tunnel as the initiator.
    pub fn with_connector(mut self, connector: Arc<dyn TunnelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Allow accepting a side-channel tunnel as the responder.
    pub fn with_acceptor(mut self, acceptor: Arc<dyn TunnelAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Bytes moved over the tunnel, for diagnostics.
    pub fn tunnel_stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.tunnel_stats)
    }

    /// Drain bytes read past the session's final frame. They belong to
    /// the terminal stream, not the session.
    pub fn take_buffered(&mut self) -> Bytes {
        self.io.rbuf.split().freeze()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Initiator
    // =========================================================================

    /// Lifecycle of this session. `Aborted` after a failed run.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the initiator role for a recognized trigger.
    ///
    /// `upload_paths` supplies the batch when the direction is
    /// [`TransferDirection::Upload`]; an empty batch still completes a
    /// clean zero-entry session. A session object runs at most once;
    /// reusing one is rejected with [`Error::SessionBusy`].
    pub async fn initiate(
        &mut self,
        trigger: &Trigger,
        upload_paths: Vec<PathBuf>,
    ) -> Result<TransferSummary> {
        if self.state.in_session() {
            return Err(Error::SessionBusy);
        }
        self.state = SessionState::Negotiating;
        let result = self.run_initiator(trigger, upload_paths).await;
        self.state = match &result {
            Ok(_) => SessionState::Idle,
            Err(_) => SessionState::Aborted,
        };
        result
    }

    async fn run_initiator(
        &mut self,
        trigger: &Trigger,
        upload_paths: Vec<PathBuf>,
    ) -> Result<TransferSummary> {
        let config = self.negotiate(trigger).await?;
        self.open_tunnel(&config).await?;

        info!(
            variant = ?config.variant,
            direction = ?config.direction,
            tunnel = self.tunnel.is_some(),
            "session negotiated"
        );
        self.state = SessionState::Transferring;

        let finish = match config.direction {
            TransferDirection::Upload => {
                let (manifest, skipped) = Manifest::collect(&upload_paths).await;
                for (path, err) in &skipped {
                    warn!(path = %path.display(), error = %err, "entry skipped before transfer");
                }
                let mut finish = self.send_entries(&config, manifest).await?;
                finish.files_skipped += skipped.len() as u64;
                finish
            }
            TransferDirection::Download => self.recv_entries(&config).await?,
        };

        let summary = TransferSummary {
            files_ok: finish.files_ok,
            files_failed: finish.files_failed,
            files_skipped: finish.files_skipped,
            bytes: finish.bytes,
            elapsed: self.started.elapsed(),
        };
        if let Some(term) = self.term.as_deref_mut() {
            self.progress.finish(term, &summary).await?;
        }
        Ok(summary)
    }

    /// Negotiate the session configuration as the initiator.
    async fn negotiate(&mut self, trigger: &Trigger) -> Result<TransferConfig> {
        let features = self.local_features(trigger.variant);
        self.io
            .send(&Message::Hello(HelloPayload {
                version: PROTOCOL_VERSION,
                features,
            }))
            .await?;

        let ack = match self.io.recv_control().await? {
            Message::HelloAck(ack) => ack,
            other => {
                return Err(Error::Negotiate {
                    message: format!("expected HelloAck, got {}", other.name()),
                });
            }
        };
        if !ack.accepted {
            return Err(Error::Negotiate {
                message: ack
                    .reject_reason
                    .unwrap_or_else(|| "peer rejected session".into()),
            });
        }
        if ack.version == 0 || ack.version > PROTOCOL_VERSION {
            return Err(Error::Negotiate {
                message: format!("peer selected unsupported version {}", ack.version),
            });
        }

        let cols = *self.cols.borrow();
        let mut config = TransferConfig::from_filter(self.filter, trigger.variant, trigger.direction, cols);
        config.version = ack.version;
        config.compress = features.compress && ack.features.compress;
        config.tunnel_port = if features.tunnel && ack.features.tunnel {
            ack.tunnel_port
        } else {
            None
        };

        self.io.send(&Message::Config(config.clone())).await?;
        match self.io.recv_control().await? {
            Message::ConfigAck => {}
            other => {
                return Err(Error::Negotiate {
                    message: format!("expected ConfigAck, got {}", other.name()),
                });
            }
        }
        Ok(config)
    }

    fn local_features(&self, variant: ProtocolVariant) -> Features {
        // The legacy variant has neither compression nor a tunnel.
        let native = variant == ProtocolVariant::Native;
        Features {
            compress: native && self.filter.compress && cfg!(feature = "compression"),
            tunnel: native && self.filter.tunnel && self.connector.is_some(),
        }
    }

    /// Try to bring up the side channel. Failure is a downgrade, never an
    /// abort. The peer is waiting for the verdict whenever a port was
    /// negotiated, so every path out of here tells it one.
    async fn open_tunnel(&mut self, config: &TransferConfig) -> Result<()> {
        let Some(port) = config.tunnel_port else {
            return Ok(());
        };
        let stream = match self.connector.as_ref() {
            Some(connector) => match connector.connect(port).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(port, error = %e, "tunnel connect failed, staying inline");
                    None
                }
            },
            None => None,
        };
        match stream {
            Some(stream) => {
                self.io.send(&Message::TunnelOpen { port }).await?;
                match self.io.recv_control().await? {
                    Message::TunnelAck { accepted: true } => {
                        debug!(port, "tunnel established");
                        self.tunnel = Some(TunnelIo::new(stream, Arc::clone(&self.tunnel_stats)));
                    }
                    Message::TunnelAck { accepted: false } => {
                        debug!(port, "peer declined tunnel, staying inline");
                    }
                    other => {
                        return Err(Error::Protocol {
                            message: format!("expected TunnelAck, got {}", other.name()),
                        });
                    }
                }
            }
            None => self.io.send(&Message::TunnelDown).await?,
        }
        Ok(())
    }

    // =========================================================================
    // Responder
    // =========================================================================

    /// Run the responder role: answer the initiator's handshake, then run
    /// the engine opposite to the negotiated direction.
    pub async fn respond(&mut self) -> Result<TransferSummary> {
        if self.state.in_session() {
            return Err(Error::SessionBusy);
        }
        self.state = SessionState::Negotiating;
        let result = self.run_responder().await;
        self.state = match &result {
            Ok(_) => SessionState::Idle,
            Err(_) => SessionState::Aborted,
        };
        result
    }

    async fn run_responder(&mut self) -> Result<TransferSummary> {
        let hello = match self.io.recv_control().await? {
            Message::Hello(hello) => hello,
            other => {
                return Err(Error::Negotiate {
                    message: format!("expected Hello, got {}", other.name()),
                });
            }
        };
        let version = hello.version.min(PROTOCOL_VERSION);
        let features = Features {
            compress: hello.features.compress && self.filter.compress && cfg!(feature = "compression"),
            tunnel: hello.features.tunnel && self.filter.tunnel && self.acceptor.is_some(),
        };
        let tunnel_port = if features.tunnel {
            self.acceptor.as_ref().map(|a| a.port())
        } else {
            None
        };
        self.io
            .send(&Message::HelloAck(HelloAckPayload {
                version,
                accepted: true,
                reject_reason: None,
                features,
                tunnel_port,
            }))
            .await?;

        let config = match self.io.recv_control().await? {
            Message::Config(config) => config,
            other => {
                return Err(Error::Negotiate {
                    message: format!("expected Config, got {}", other.name()),
                });
            }
        };
        self.io.send(&Message::ConfigAck).await?;

        // The initiator may now request the tunnel it was offered.
        if config.tunnel_port.is_some() {
            self.maybe_accept_tunnel().await?;
        }
        self.state = SessionState::Transferring;

        let finish = match config.direction.flipped() {
            TransferDirection::Upload => {
                let paths = self.filter.upload_dir.clone().into_iter().collect::<Vec<_>>();
                let (manifest, skipped) = Manifest::collect(&paths).await;
                let mut finish = self.send_entries(&config, manifest).await?;
                finish.files_skipped += skipped.len() as u64;
                finish
            }
            TransferDirection::Download => self.recv_entries(&config).await?,
        };

        Ok(TransferSummary {
            files_ok: finish.files_ok,
            files_failed: finish.files_failed,
            files_skipped: finish.files_skipped,
            bytes: finish.bytes,
            elapsed: self.started.elapsed(),
        })
    }

    async fn maybe_accept_tunnel(&mut self) -> Result<()> {
        let port = match self.io.recv_control().await? {
            Message::TunnelOpen { port } => port,
            // Initiator could not bring the tunnel up; stay inline.
            Message::TunnelDown => return Ok(()),
            // Older initiator that skips the verdict; the message read is
            // the first transfer message, so put it back.
            other => {
                self.io.rbuf_prepend(other)?;
                return Ok(());
            }
        };
        let Some(acceptor) = self.acceptor.as_ref() else {
            self.io.send(&Message::TunnelAck { accepted: false }).await?;
            return Ok(());
        };
        match timeout(CONTROL_TIMEOUT, acceptor.accept()).await {
            Ok(Ok(stream)) => {
                self.io.send(&Message::TunnelAck { accepted: true }).await?;
                self.tunnel = Some(TunnelIo::new(stream, Arc::clone(&self.tunnel_stats)));
            }
            Ok(Err(e)) => {
                warn!(port, error = %e, "tunnel accept failed");
                self.io.send(&Message::TunnelAck { accepted: false }).await?;
            }
            Err(_) => {
                self.io.send(&Message::TunnelAck { accepted: false }).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Sending engine
    // =========================================================================

    /// Stream every manifest entry to the peer.
    async fn send_entries(
        &mut self,
        config: &TransferConfig,
        manifest: Manifest,
    ) -> Result<FinishPayload> {
        self.state.expect(SessionState::Transferring)?;
        self.io
            .send(&Message::Manifest(ManifestPayload {
                entries: manifest.entries.clone(),
                total_bytes: manifest.total_bytes,
            }))
            .await?;
        match self.io.recv_control().await? {
            Message::ManifestAck => {}
            Message::Abort { reason } => return Err(abort_error(reason)),
            other => {
                return Err(Error::Protocol {
                    message: format!("expected ManifestAck, got {}", other.name()),
                });
            }
        }

        let chunk_size = payload_size(config);
        let compressor = Compressor::with_default_level();
        let mut finish = FinishPayload::default();
        let mut done_bytes = 0u64;
        let files_total = manifest.entries.iter().filter(|e| !e.is_dir).count();

        for (index, entry) in manifest.entries.iter().enumerate() {
            if self.cancelled() {
                self.io
                    .send(&Message::Abort {
                        reason: "cancelled".into(),
                    })
                    .await?;
                return Err(Error::Cancelled);
            }
            if entry.is_dir {
                // Directories are created from the manifest on the far side.
                continue;
            }

            let source = &manifest.sources[index];
            let file = match File::open(source).await {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %source.display(), error = %e, "cannot open entry, skipping");
                    self.io
                        .send(&Message::EntrySkip(EntryFailPayload {
                            index: index as u32,
                            reason: e.to_string(),
                        }))
                        .await?;
                    finish.files_skipped += 1;
                    continue;
                }
            };

            match self
                .send_one_entry(
                    config,
                    &compressor,
                    chunk_size,
                    index as u32,
                    entry,
                    file,
                    &mut done_bytes,
                    manifest.total_bytes,
                    finish.files_ok as usize + finish.files_failed as usize,
                    files_total,
                )
                .await?
            {
                EntryOutcome::Ok(bytes) => {
                    finish.files_ok += 1;
                    finish.bytes += bytes;
                }
                EntryOutcome::Failed => finish.files_failed += 1,
            }
        }

        self.state = SessionState::Finishing;
        self.io.send(&Message::Finish(finish)).await?;
        match timeout(FINISH_GRACE, self.io.recv()).await {
            Ok(Ok(Message::FinishAck)) => {}
            Ok(Ok(other)) => {
                debug!(msg = other.name(), "unexpected closing message, proceeding");
            }
            Ok(Err(e)) => debug!(error = %e, "stream ended before FinishAck"),
            Err(_) => debug!("no FinishAck within grace period, proceeding"),
        }
        Ok(finish)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_one_entry(
        &mut self,
        config: &TransferConfig,
        compressor: &Compressor,
        chunk_size: usize,
        index: u32,
        entry: &ManifestEntry,
        mut file: File,
        done_bytes: &mut u64,
        total_bytes: u64,
        file_index: usize,
        files_total: usize,
    ) -> Result<EntryOutcome> {
        self.io.send(&Message::EntryOpen(EntryOpenPayload { index })).await?;

        let try_compress = config.compress && !is_compressed_extension(&entry.path);
        let mut hasher = StreamingHasher::new();
        let mut entry_bytes = 0u64;
        let mut seq = 0u64;

        let mut crlf_prev = 0u8;
        let mut buf = read_chunk(&mut file, chunk_size, config.crlf, &mut crlf_prev).await?;
        loop {
            if self.cancelled() {
                self.io
                    .send(&Message::Abort {
                        reason: "cancelled".into(),
                    })
                    .await?;
                return Err(Error::Cancelled);
            }

            let next = read_chunk(&mut file, chunk_size, config.crlf, &mut crlf_prev).await?;
            let last = next.is_empty();

            hasher.update(&buf);
            entry_bytes += buf.len() as u64;
            *done_bytes += buf.len() as u64;

            let compressed = try_compress && compressor.should_compress(&buf);
            let payload = if compressed {
                compressor.compress(&buf)?
            } else {
                std::mem::take(&mut buf)
            };
            let chunk = make_chunk(seq, payload, compressed, last);

            match self.deliver_chunk(config, &chunk).await {
                Ok(ChunkVerdict::Delivered) => {}
                Ok(ChunkVerdict::EntryFailed(reason)) => {
                    warn!(path = %entry.path, reason, "entry abandoned by peer");
                    return Ok(EntryOutcome::Failed);
                }
                // An entry-level failure is reported to the peer so its
                // summary counts it; the session moves to the next entry.
                Err(e) if e.is_entry_level() => {
                    warn!(path = %entry.path, error = %e, "abandoning entry");
                    self.io
                        .send(&Message::EntryFail(EntryFailPayload {
                            index,
                            reason: e.to_string(),
                        }))
                        .await?;
                    return Ok(EntryOutcome::Failed);
                }
                Err(e) => return Err(e),
            }

            self.render_progress(&entry.path, file_index, files_total, *done_bytes, total_bytes, last)
                .await?;

            if last {
                break;
            }
            buf = next;
            seq += 1;
        }

        self.io
            .send(&Message::EntryDone(EntryDonePayload {
                index,
                checksum: hasher.finish(),
                size: entry_bytes,
            }))
            .await?;
        match self.io.recv_control().await? {
            Message::EntryOk { index: i } if i == index => Ok(EntryOutcome::Ok(entry_bytes)),
            Message::EntryFail(fail) if fail.index == index => {
                warn!(path = %entry.path, reason = fail.reason, "entry rejected after transfer");
                Ok(EntryOutcome::Failed)
            }
            Message::Abort { reason } => Err(abort_error(reason)),
            other => Err(Error::Protocol {
                message: format!("expected entry verdict, got {}", other.name()),
            }),
        }
    }

    /// Send one chunk and, for acknowledged variants, wait for its
    /// verdict, retrying on `Nak` within the retry budget.
    async fn deliver_chunk(
        &mut self,
        config: &TransferConfig,
        chunk: &ChunkPayload,
    ) -> Result<ChunkVerdict> {
        let mut attempts = 0u32;
        loop {
            self.send_data(Message::Data(chunk.clone())).await?;
            if !config.variant.acknowledged() {
                return Ok(ChunkVerdict::Delivered);
            }
            match self.io.recv().await? {
                Message::Ack(AckPayload { seq }) if seq == chunk.seq => {
                    return Ok(ChunkVerdict::Delivered);
                }
                Message::Nak(NakPayload { seq, reason }) if seq == chunk.seq => {
                    attempts += 1;
                    if attempts >= MAX_CHUNK_RETRIES {
                        debug!(seq, reason, "retry budget exhausted");
                        return Err(Error::ChunkChecksum { seq });
                    }
                    debug!(seq, attempt = attempts, reason, "chunk rejected, resending");
                }
                Message::EntryFail(fail) => {
                    return Ok(ChunkVerdict::EntryFailed(fail.reason));
                }
                Message::Abort { reason } => return Err(abort_error(reason)),
                other => {
                    return Err(Error::Protocol {
                        message: format!("expected chunk verdict, got {}", other.name()),
                    });
                }
            }
        }
    }

    /// Route a `Data` frame to the tunnel when one is up, falling back to
    /// the primary stream if the tunnel write fails.
    async fn send_data(&mut self, msg: Message) -> Result<()> {
        if let Some(tunnel) = &mut self.tunnel {
            match tunnel.send(&msg).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "tunnel write failed, falling back inline");
                    self.tunnel = None;
                    self.io.send(&Message::TunnelDown).await?;
                }
            }
        }
        self.io.send(&msg).await
    }

    // =========================================================================
    // Receiving engine
    // =========================================================================

    /// Receive every manifest entry from the peer.
    async fn recv_entries(&mut self, config: &TransferConfig) -> Result<FinishPayload> {
        self.state.expect(SessionState::Transferring)?;
        let manifest = match self.recv_session_msg().await? {
            Message::Manifest(m) => m,
            Message::Abort { reason } => return Err(abort_error(reason)),
            other => {
                return Err(Error::Protocol {
                    message: format!("expected Manifest, got {}", other.name()),
                });
            }
        };

        // `config.dest_dir` on the wire is informational; the receiving
        // side always writes under its own configured directory.
        let dest_dir = self.filter.download_dir.clone();
        fs::create_dir_all(&dest_dir).await?;

        // Destinations resolve before any data moves; traversal attempts
        // fail their entry, never the session.
        let mut dests: Vec<Option<PathBuf>> = Vec::with_capacity(manifest.entries.len());
        let mut finish = FinishPayload::default();
        for entry in &manifest.entries {
            match resolve_dest(&dest_dir, &entry.path) {
                Ok(dest) => dests.push(Some(dest)),
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "rejecting manifest entry");
                    finish.files_failed += u64::from(!entry.is_dir);
                    dests.push(None);
                }
            }
        }
        self.io.send(&Message::ManifestAck).await?;

        for (entry, dest) in manifest.entries.iter().zip(&dests) {
            if entry.is_dir
                && let Some(dest) = dest
            {
                fs::create_dir_all(dest).await?;
            }
        }

        let decompressor = Decompressor::new();
        let files_total = manifest.entries.iter().filter(|e| !e.is_dir).count();
        let mut done_bytes = 0u64;
        let mut current: Option<EntryRecv> = None;

        loop {
            if self.cancelled() {
                self.io
                    .send(&Message::Abort {
                        reason: "cancelled".into(),
                    })
                    .await?;
                cleanup_entry(current.take()).await;
                return Err(Error::Cancelled);
            }

            match self.recv_session_msg().await? {
                Message::EntryOpen(open) => {
                    cleanup_entry(current.take()).await;
                    current = Some(
                        self.open_entry(&manifest.entries, &dests, open.index, &mut finish)
                            .await?,
                    );
                }
                Message::Data(chunk) => {
                    let Some(cur) = current.as_mut() else {
                        self.io
                            .send(&Message::Abort {
                                reason: "data before entry open".into(),
                            })
                            .await?;
                        return Err(Error::Protocol {
                            message: "data frame outside an open entry".into(),
                        });
                    };
                    let uncompressed = recv_chunk(cur, chunk, config, &decompressor).await?;
                    match uncompressed {
                        ChunkRecv::Advance(n) => {
                            done_bytes += n;
                            if config.variant.acknowledged() {
                                self.io
                                    .send(&Message::Ack(AckPayload {
                                        seq: cur.expected_seq - 1,
                                    }))
                                    .await?;
                            }
                            let name = cur.name.clone();
                            let file_index = cur.file_index;
                            self.render_progress(
                                &name,
                                file_index,
                                files_total,
                                done_bytes,
                                manifest.total_bytes,
                                false,
                            )
                            .await?;
                        }
                        ChunkRecv::Duplicate(seq) => {
                            if config.variant.acknowledged() {
                                self.io.send(&Message::Ack(AckPayload { seq })).await?;
                            }
                        }
                        ChunkRecv::Rejected(nak) => {
                            if config.variant.acknowledged() {
                                self.io.send(&Message::Nak(nak)).await?;
                            }
                            // Unacknowledged variant: the whole-file
                            // checksum at EntryDone catches the corruption.
                        }
                        ChunkRecv::OutOfOrder(seq) => {
                            self.io
                                .send(&Message::Abort {
                                    reason: format!("out-of-order chunk {seq}"),
                                })
                                .await?;
                            cleanup_entry(current.take()).await;
                            return Err(Error::Protocol {
                                message: format!("out-of-order chunk {seq}"),
                            });
                        }
                    }
                }
                Message::EntryDone(done) => {
                    let Some(cur) = current.take() else {
                        return Err(Error::Protocol {
                            message: "entry done outside an open entry".into(),
                        });
                    };
                    self.close_entry(cur, done, &mut finish).await?;
                }
                Message::EntrySkip(skip) => {
                    debug!(index = skip.index, reason = skip.reason, "peer skipped entry");
                    finish.files_skipped += 1;
                }
                Message::EntryFail(fail) => {
                    warn!(index = fail.index, reason = fail.reason, "peer abandoned entry");
                    cleanup_entry(current.take()).await;
                    finish.files_failed += 1;
                }
                Message::TunnelDown => {
                    debug!("peer dropped tunnel, continuing inline");
                    self.tunnel = None;
                }
                Message::Finish(peer) => {
                    self.state = SessionState::Finishing;
                    if peer.files_ok != finish.files_ok {
                        debug!(
                            peer = peer.files_ok,
                            local = finish.files_ok,
                            "finish count mismatch"
                        );
                    }
                    self.io.send(&Message::FinishAck).await?;
                    cleanup_entry(current.take()).await;
                    return Ok(finish);
                }
                Message::Abort { reason } => {
                    cleanup_entry(current.take()).await;
                    return Err(abort_error(reason));
                }
                other => {
                    return Err(Error::Protocol {
                        message: format!("unexpected transfer message {}", other.name()),
                    });
                }
            }
        }
    }

    /// Open the destination for one manifest entry. A filesystem or
    /// traversal failure fails the entry, not the session: the peer is
    /// told immediately and subsequent data frames are discarded.
    async fn open_entry(
        &mut self,
        entries: &[ManifestEntry],
        dests: &[Option<PathBuf>],
        index: u32,
        finish: &mut FinishPayload,
    ) -> Result<EntryRecv> {
        let (entry, dest) = match (entries.get(index as usize), dests.get(index as usize)) {
            (Some(entry), Some(dest)) if !entry.is_dir => (entry, dest.clone()),
            _ => {
                self.io
                    .send(&Message::Abort {
                        reason: format!("invalid entry index {index}"),
                    })
                    .await?;
                return Err(Error::Protocol {
                    message: format!("invalid entry index {index}"),
                });
            }
        };
        let file_index = (finish.files_ok + finish.files_failed + finish.files_skipped) as usize;

        let Some(dest) = dest else {
            // Traversal rejected at manifest time; already counted failed.
            self.io
                .send(&Message::EntryFail(EntryFailPayload {
                    index,
                    reason: "destination escapes download directory".into(),
                }))
                .await?;
            return Ok(EntryRecv::discard(index, &entry.path, file_index));
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = dest.with_extension(partial_extension(&dest));
        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial)
            .await
        {
            Ok(file) => Ok(EntryRecv {
                index,
                name: entry.path.clone(),
                file_index,
                file: Some(file),
                partial: Some(partial),
                dest: Some(dest),
                hasher: StreamingHasher::new(),
                expected_seq: 0,
                corrupt: false,
            }),
            Err(e) => {
                warn!(path = %dest.display(), error = %e, "cannot open destination");
                self.io
                    .send(&Message::EntryFail(EntryFailPayload {
                        index,
                        reason: e.to_string(),
                    }))
                    .await?;
                finish.files_failed += 1;
                Ok(EntryRecv::discard(index, &entry.path, file_index))
            }
        }
    }

    /// Verify and commit one received entry.
    async fn close_entry(
        &mut self,
        mut cur: EntryRecv,
        done: EntryDonePayload,
        finish: &mut FinishPayload,
    ) -> Result<()> {
        if done.index != cur.index {
            return Err(Error::Protocol {
                message: format!("entry done for {} while {} open", done.index, cur.index),
            });
        }
        if cur.file.is_none() {
            // Already failed at open; the peer saw EntryFail then.
            cleanup_entry(Some(cur)).await;
            return Ok(());
        }

        let checksum = cur.hasher.finish();
        let ok = !cur.corrupt && checksum == done.checksum;
        if ok {
            if let Some(mut file) = cur.file.take() {
                file.flush().await?;
            }
            if let (Some(partial), Some(dest)) = (cur.partial.take(), cur.dest.take()) {
                fs::rename(&partial, &dest).await?;
            }
            self.io.send(&Message::EntryOk { index: done.index }).await?;
            finish.files_ok += 1;
            finish.bytes += done.size;
        } else {
            warn!(
                index = done.index,
                expected = done.checksum,
                actual = checksum,
                "whole-file checksum mismatch"
            );
            cleanup_entry(Some(cur)).await;
            self.io
                .send(&Message::EntryFail(EntryFailPayload {
                    index: done.index,
                    reason: "whole-file checksum mismatch".into(),
                }))
                .await?;
            finish.files_failed += 1;
        }
        Ok(())
    }

    /// Receive the next message from the primary stream or the tunnel,
    /// whichever produces a complete frame first. Tunnel EOF downgrades to
    /// inline delivery.
    async fn recv_session_msg(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.io.wire.decode(&mut self.io.rbuf)? {
                trace!(msg = msg.name(), "recv");
                return Ok(msg);
            }
            let mut drop_tunnel = false;
            match &mut self.tunnel {
                Some(tunnel) => {
                    if let Some(msg) = WireFormat::Native.decode(&mut tunnel.rbuf)? {
                        trace!(msg = msg.name(), "recv (tunnel)");
                        return Ok(msg);
                    }
                    tokio::select! {
                        n = self.io.reader.read_buf(&mut self.io.rbuf) => {
                            if n? == 0 {
                                return Err(Error::StreamClosed);
                            }
                        }
                        n = tunnel.stream.read_buf(&mut tunnel.rbuf) => match n {
                            Ok(0) => drop_tunnel = true,
                            Ok(n) => tunnel.stats.add_received(n as u64),
                            Err(e) => {
                                debug!(error = %e, "tunnel read failed");
                                drop_tunnel = true;
                            }
                        },
                    }
                }
                None => {
                    let n = self.io.reader.read_buf(&mut self.io.rbuf).await?;
                    if n == 0 {
                        return Err(Error::StreamClosed);
                    }
                }
            }
            if drop_tunnel {
                debug!("tunnel closed, continuing inline");
                self.tunnel = None;
            }
        }
    }

    async fn render_progress(
        &mut self,
        name: &str,
        file_index: usize,
        files_total: usize,
        done: u64,
        total: u64,
        force: bool,
    ) -> Result<()> {
        // Copy the width out before awaiting; the watch guard is not Send.
        let cols = *self.cols.borrow();
        let Some(term) = self.term.as_deref_mut() else {
            return Ok(());
        };
        let snapshot = ProgressSnapshot {
            file_index: file_index.min(files_total.saturating_sub(1)),
            files_total,
            name: name.to_string(),
            bytes_done: done,
            bytes_total: total,
            started: self.started,
        };
        self.progress.render(term, &snapshot, cols, force).await
    }
}

impl SessionIo<'_> {
    /// Re-queue a decoded message at the front of the read buffer.
    /// Used once, when the responder peeks for an optional TunnelOpen.
    fn rbuf_prepend(&mut self, msg: Message) -> Result<()> {
        let frame = self.wire.encode(&msg)?;
        let mut buf = BytesMut::with_capacity(frame.len() + self.rbuf.len());
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(&self.rbuf);
        self.rbuf = buf;
        Ok(())
    }
}

// =============================================================================
// Entry bookkeeping
// =============================================================================

enum EntryOutcome {
    Ok(u64),
    Failed,
}

enum ChunkVerdict {
    Delivered,
    /// The peer gave up on this entry; it already counted the failure.
    EntryFailed(String),
}

enum ChunkRecv {
    /// Chunk accepted; `n` payload bytes written.
    Advance(u64),
    /// Already-seen sequence number, re-acknowledged and dropped.
    Duplicate(u64),
    /// Checksum mismatch, peer asked to resend.
    Rejected(NakPayload),
    /// Sequence number from the future; protocol violation.
    OutOfOrder(u64),
}

/// Receiving-side state for the entry currently open.
struct EntryRecv {
    index: u32,
    name: String,
    file_index: usize,
    /// `None` while discarding a failed entry's remaining frames.
    file: Option<File>,
    partial: Option<PathBuf>,
    dest: Option<PathBuf>,
    hasher: StreamingHasher,
    expected_seq: u64,
    corrupt: bool,
}

impl EntryRecv {
    fn discard(index: u32, name: &str, file_index: usize) -> Self {
        Self {
            index,
            name: name.to_string(),
            file_index,
            file: None,
            partial: None,
            dest: None,
            hasher: StreamingHasher::new(),
            expected_seq: 0,
            corrupt: true,
        }
    }
}

/// Validate, decompress, and write one received chunk.
async fn recv_chunk(
    cur: &mut EntryRecv,
    chunk: ChunkPayload,
    config: &TransferConfig,
    decompressor: &Decompressor,
) -> Result<ChunkRecv> {
    if chunk.seq < cur.expected_seq {
        trace!(seq = chunk.seq, "duplicate chunk");
        return Ok(ChunkRecv::Duplicate(chunk.seq));
    }
    if chunk.seq > cur.expected_seq {
        return Ok(ChunkRecv::OutOfOrder(chunk.seq));
    }
    if !verify_chunk(&chunk) {
        if !config.variant.acknowledged() {
            // No resend path; the entry is doomed but the stream position
            // must stay consistent, so keep consuming.
            cur.corrupt = true;
            cur.expected_seq += 1;
            return Ok(ChunkRecv::Advance(0));
        }
        return Ok(ChunkRecv::Rejected(NakPayload {
            seq: chunk.seq,
            reason: "chunk checksum mismatch".into(),
        }));
    }

    cur.expected_seq += 1;
    let data = if chunk.compressed {
        decompressor.decompress(&chunk.data)?
    } else {
        chunk.data
    };
    cur.hasher.update(&data);
    if let Some(file) = cur.file.as_mut() {
        file.write_all(&data).await?;
    }
    Ok(ChunkRecv::Advance(data.len() as u64))
}

/// Remove the partial file of an entry that did not complete.
async fn cleanup_entry(cur: Option<EntryRecv>) {
    if let Some(cur) = cur
        && let Some(partial) = cur.partial
        && let Err(e) = fs::remove_file(&partial).await
    {
        debug!(path = %partial.display(), error = %e, "partial cleanup failed");
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Payload bytes per chunk for the negotiated variant. Legacy frames are
/// sized from the terminal width recorded at negotiation.
fn payload_size(config: &TransferConfig) -> usize {
    match config.variant {
        ProtocolVariant::Native => CHUNK_SIZE,
        ProtocolVariant::Legacy => chunk_size_for_cols(config.cols),
    }
}

/// Read up to `chunk_size` source bytes, optionally expanding `\n` to
/// `\r\n` for a line-ending-converting session. `crlf_prev` carries the
/// last source byte across chunk boundaries so a `\r\n` pair split over
/// two reads is not doubled.
async fn read_chunk(
    file: &mut File,
    chunk_size: usize,
    crlf: bool,
    crlf_prev: &mut u8,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    if crlf {
        buf = expand_crlf(&buf, crlf_prev);
    }
    Ok(buf)
}

/// Replace every bare `\n` with `\r\n`. Already-paired `\r\n` stays as is.
fn expand_crlf(data: &[u8], prev: &mut u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for &b in data {
        if b == b'\n' && *prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        *prev = b;
    }
    out
}

/// `.ext` destinations become `.ext.txf.partial`; extensionless ones get
/// the suffix directly.
fn partial_extension(dest: &std::path::Path) -> String {
    match dest.extension() {
        Some(ext) => format!("{}{}", ext.to_string_lossy(), PARTIAL_SUFFIX),
        None => PARTIAL_SUFFIX.trim_start_matches('.').to_string(),
    }
}

fn abort_error(reason: String) -> Error {
    if reason == "cancelled" {
        Error::Cancelled
    } else {
        Error::Protocol {
            message: format!("peer aborted: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_session_parks_in_aborted_and_rejects_reuse() {
        let (near, far) = tokio::io::duplex(4 * 1024);
        let peer = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(far);
            let mut io = SessionIo::new(&mut r, &mut w, WireFormat::Native);
            assert!(matches!(io.recv().await.unwrap(), Message::Hello(_)));
            io.send(&Message::HelloAck(HelloAckPayload {
                version: PROTOCOL_VERSION,
                accepted: false,
                reject_reason: Some("busy".into()),
                features: Features::default(),
                tunnel_port: None,
            }))
            .await
            .unwrap();
        });

        let filter = FilterConfig::default();
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut r, mut w) = tokio::io::split(near);
        let io = SessionIo::new(&mut r, &mut w, WireFormat::Native);
        let mut session = TransferSession::new(io, &filter, cancel);
        assert_eq!(session.state(), SessionState::Idle);

        let trigger = Trigger {
            variant: ProtocolVariant::Native,
            direction: TransferDirection::Download,
            version: Some(PROTOCOL_VERSION),
            cols: Some(80),
        };
        let err = session.initiate(&trigger, Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Negotiate { .. }));
        assert_eq!(session.state(), SessionState::Aborted);

        // The object is spent; a second run is refused outright.
        let err = session.initiate(&trigger, Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::SessionBusy));
        peer.await.unwrap();
    }

    #[test]
    fn expand_crlf_is_idempotent_on_converted_input() {
        let mut prev = 0u8;
        assert_eq!(expand_crlf(b"a\nb\n", &mut prev), b"a\r\nb\r\n");
        prev = 0;
        assert_eq!(expand_crlf(b"a\r\nb", &mut prev), b"a\r\nb");
        prev = 0;
        assert_eq!(expand_crlf(b"no newline", &mut prev), b"no newline");
        prev = 0;
        let once = expand_crlf(b"x\ny", &mut prev);
        prev = 0;
        assert_eq!(expand_crlf(&once, &mut prev), once);
    }

    #[test]
    fn expand_crlf_pair_split_across_chunks() {
        let mut prev = 0u8;
        let a = expand_crlf(b"line\r", &mut prev);
        let b = expand_crlf(b"\nnext", &mut prev);
        let mut joined = a;
        joined.extend_from_slice(&b);
        assert_eq!(joined, b"line\r\nnext");
    }

    #[test]
    fn payload_size_by_variant() {
        let mut config = TransferConfig::from_filter(
            &FilterConfig::default(),
            ProtocolVariant::Native,
            TransferDirection::Upload,
            100,
        );
        assert_eq!(payload_size(&config), CHUNK_SIZE);

        config.variant = ProtocolVariant::Legacy;
        assert_eq!(payload_size(&config), chunk_size_for_cols(100));
    }

    #[test]
    fn partial_name_keeps_extension() {
        assert_eq!(
            partial_extension(std::path::Path::new("/tmp/a.tar")),
            "tar.txf.partial"
        );
        assert_eq!(partial_extension(std::path::Path::new("/tmp/a")), "txf.partial");
    }

    #[test]
    fn abort_reason_mapping() {
        assert!(matches!(abort_error("cancelled".into()), Error::Cancelled));
        assert!(matches!(
            abort_error("bad frame".into()),
            Error::Protocol { .. }
        ));
    }

    #[tokio::test]
    async fn recv_chunk_orders_and_verifies() {
        let config = TransferConfig::from_filter(
            &FilterConfig::default(),
            ProtocolVariant::Native,
            TransferDirection::Download,
            80,
        );
        let decompressor = Decompressor::new();
        let mut cur = EntryRecv::discard(0, "x", 0);
        cur.corrupt = false;

        let good = make_chunk(0, b"hello".to_vec(), false, false);
        match recv_chunk(&mut cur, good.clone(), &config, &decompressor).await.unwrap() {
            ChunkRecv::Advance(5) => {}
            other_len => panic!("unexpected: {:?}", discriminant_name(&other_len)),
        }

        // Replay of seq 0 is a duplicate
        match recv_chunk(&mut cur, good, &config, &decompressor).await.unwrap() {
            ChunkRecv::Duplicate(0) => {}
            other => panic!("unexpected: {:?}", discriminant_name(&other)),
        }

        // Corrupted payload is rejected
        let mut bad = make_chunk(1, b"world".to_vec(), false, false);
        bad.data[0] ^= 0xff;
        match recv_chunk(&mut cur, bad, &config, &decompressor).await.unwrap() {
            ChunkRecv::Rejected(nak) => assert_eq!(nak.seq, 1),
            other => panic!("unexpected: {:?}", discriminant_name(&other)),
        }

        // Skipping ahead is a protocol violation
        let future = make_chunk(5, b"!".to_vec(), false, true);
        match recv_chunk(&mut cur, future, &config, &decompressor).await.unwrap() {
            ChunkRecv::OutOfOrder(5) => {}
            other => panic!("unexpected: {:?}", discriminant_name(&other)),
        }
    }

    fn discriminant_name(r: &ChunkRecv) -> &'static str {
        match r {
            ChunkRecv::Advance(_) => "Advance",
            ChunkRecv::Duplicate(_) => "Duplicate",
            ChunkRecv::Rejected(_) => "Rejected",
            ChunkRecv::OutOfOrder(_) => "OutOfOrder",
        }
    }
}
