//! The stream filter: transparent relay with inline trigger detection.
//!
//! `StreamFilter::run` shadows the two directions of a terminal stream.
//! While idle it forwards bytes unmodified, watching the remote-to-local
//! direction for trigger markers. A recognized trigger hands the remote
//! stream to a [`TransferSession`]; when the session ends, both detectors
//! reset and passthrough resumes on the same loop iteration.
//!
//! During a session, local keystrokes are not forwarded (the remote end
//! is speaking the transfer protocol, not a shell); `Ctrl-C` requests
//! cancellation, which the session observes at the next chunk boundary.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::detect::{DetectEvent, Trigger, TriggerDetector};
use crate::error::{Error, Result};
use crate::session::{SessionCommand, SessionIo, SessionState, TransferSession};
use crate::terminal::{ClipboardGate, ResizeCoordinator};
use crate::tunnel::TunnelConnector;

const CTRL_C: u8 = 0x03;

/// Cloneable control surface for a running filter.
#[derive(Clone)]
pub struct FilterHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    cancel: Arc<AtomicBool>,
}

impl FilterHandle {
    /// Queue local paths for upload. If a drag-upload command template is
    /// configured, the command is typed into the remote shell to provoke
    /// the trigger; otherwise the batch waits for the next trigger.
    pub fn upload(&self, paths: Vec<PathBuf>) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::Upload(paths))
            .map_err(|_| Error::StreamClosed)
    }

    /// Cancel the active session. A no-op while idle.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.cmd_tx.send(SessionCommand::Cancel);
    }

    /// Replace the filter configuration. Takes effect at the next
    /// negotiation; the active session, if any, is unaffected.
    pub fn set_options(&self, config: FilterConfig) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::SetOptions(Box::new(config)))
            .map_err(|_| Error::StreamClosed)
    }
}

/// Transparent terminal stream filter with embedded transfer support.
pub struct StreamFilter {
    config: FilterConfig,
    resize: Arc<ResizeCoordinator>,
    connector: Option<Arc<dyn TunnelConnector>>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: Arc<AtomicBool>,
}

impl StreamFilter {
    /// Create a filter with the given configuration.
    pub fn new(config: FilterConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let resize = Arc::new(ResizeCoordinator::new(config.cols));
        Self {
            config,
            resize,
            connector: None,
            cmd_tx,
            cmd_rx,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Allow sessions to open a side-channel tunnel.
    pub fn with_connector(mut self, connector: Arc<dyn TunnelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Control surface usable from other tasks.
    pub fn handle(&self) -> FilterHandle {
        FilterHandle {
            cmd_tx: self.cmd_tx.clone(),
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Terminal size feed; push resizes here. The handle stays valid
    /// while [`run`](Self::run) owns the filter.
    pub fn resize(&self) -> Arc<ResizeCoordinator> {
        Arc::clone(&self.resize)
    }

    /// Relay the stream until the remote side closes.
    ///
    /// `local_in`/`local_out` face the user's terminal, `remote_in`/
    /// `remote_out` face the transport. Returns when `remote_in` reaches
    /// end of stream; transport errors propagate.
    pub async fn run<LI, LO, RI, RO>(
        mut self,
        mut local_in: LI,
        mut local_out: LO,
        mut remote_in: RI,
        mut remote_out: RO,
    ) -> Result<()>
    where
        LI: AsyncRead + Unpin + Send,
        LO: AsyncWrite + Unpin + Send,
        RI: AsyncRead + Unpin + Send,
        RO: AsyncWrite + Unpin + Send,
    {
        let mut detector = TriggerDetector::new();
        let mut out_detector = TriggerDetector::new();
        let mut gate = ClipboardGate::new(self.config.clipboard_passthrough);
        let mut state = SessionState::Idle;
        let mut pending_upload: Vec<PathBuf> = Vec::new();
        let mut local_buf = vec![0u8; 8 * 1024];
        let mut remote_buf = vec![0u8; 8 * 1024];
        let mut local_open = true;

        loop {
            debug_assert_eq!(state, SessionState::Idle);
            let mut fired: Option<Trigger> = None;
            tokio::select! {
                n = local_in.read(&mut local_buf), if local_open => {
                    let n = n?;
                    if n == 0 {
                        local_open = false;
                    } else {
                        for event in out_detector.feed(&local_buf[..n]) {
                            match event {
                                DetectEvent::Plain(bytes) if fired.is_none() => {
                                    remote_out.write_all(&bytes).await?;
                                }
                                // Typed after the marker on the same read;
                                // sessions swallow keystrokes anyway.
                                DetectEvent::Plain(_) => {}
                                DetectEvent::Trigger(trigger) => {
                                    // The marker names the emitter's role;
                                    // emitted locally, the roles swap.
                                    fired = Some(Trigger {
                                        direction: trigger.direction.flipped(),
                                        ..trigger
                                    });
                                }
                            }
                        }
                        remote_out.flush().await?;
                        if fired.is_some() {
                            // The inbound detector may hold a partial line
                            // of plain remote output; it predates the
                            // session, so it belongs on the screen.
                            let held = detector.take_held();
                            if !held.is_empty() {
                                local_out.write_all(&gate.feed(&held)).await?;
                                local_out.flush().await?;
                            }
                        }
                    }
                }
                n = remote_in.read(&mut remote_buf) => {
                    let n = n?;
                    if n == 0 {
                        // Remote closed; flush whatever the detector holds.
                        for event in detector.finish() {
                            match event {
                                DetectEvent::Plain(bytes) => {
                                    local_out.write_all(&gate.feed(&bytes)).await?;
                                }
                                DetectEvent::Trigger(trigger) => {
                                    debug!(?trigger, "trigger at end of stream, ignored");
                                }
                            }
                        }
                        local_out.flush().await?;
                        return Ok(());
                    }
                    for event in detector.feed(&remote_buf[..n]) {
                        match event {
                            DetectEvent::Plain(bytes) => {
                                local_out.write_all(&gate.feed(&bytes)).await?;
                            }
                            DetectEvent::Trigger(trigger) => fired = Some(trigger),
                        }
                    }
                    local_out.flush().await?;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Upload(paths)) => {
                            if let Some(cmd) = self.config.drag_upload_command(&paths) {
                                remote_out.write_all(cmd.as_bytes()).await?;
                                remote_out.write_all(b"\r").await?;
                                remote_out.flush().await?;
                            }
                            pending_upload = paths;
                        }
                        Some(SessionCommand::Cancel) => {
                            // Nothing active; clear a stale flag.
                            self.cancel.store(false, Ordering::Relaxed);
                        }
                        Some(SessionCommand::SetOptions(config)) => {
                            self.config = *config;
                            gate = ClipboardGate::new(self.config.clipboard_passthrough);
                        }
                        None => {
                            // All handles dropped; keep relaying.
                        }
                    }
                }
            }

            // Back-to-back sessions are legal: the bytes past one
            // session's final frame may open the next.
            while let Some(trigger) = fired.take() {
                state = SessionState::Negotiating;
                debug!(?state, "stream taken over");
                let paths = std::mem::take(&mut pending_upload);
                let leftover = self
                    .run_session(
                        &trigger,
                        paths,
                        &mut detector,
                        &mut local_in,
                        &mut local_out,
                        &mut remote_in,
                        &mut remote_out,
                        local_open,
                    )
                    .await?;
                state = SessionState::Idle;
                detector.reset();
                out_detector.reset();
                if !leftover.is_empty() {
                    for event in detector.feed(&leftover) {
                        match event {
                            DetectEvent::Plain(bytes) => {
                                local_out.write_all(&gate.feed(&bytes)).await?;
                            }
                            DetectEvent::Trigger(trigger) => fired = Some(trigger),
                        }
                    }
                    local_out.flush().await?;
                }
            }
        }
    }

    /// Drive one transfer session to completion while keeping the local
    /// side responsive for cancellation. Returns remote bytes read past
    /// the session's final frame.
    #[allow(clippy::too_many_arguments)]
    async fn run_session<LI, LO, RI, RO>(
        &mut self,
        trigger: &Trigger,
        paths: Vec<PathBuf>,
        detector: &mut TriggerDetector,
        local_in: &mut LI,
        local_out: &mut LO,
        remote_in: &mut RI,
        remote_out: &mut RO,
        local_open: bool,
    ) -> Result<bytes::Bytes>
    where
        LI: AsyncRead + Unpin + Send,
        LO: AsyncWrite + Unpin + Send,
        RI: AsyncRead + Unpin + Send,
        RO: AsyncWrite + Unpin + Send,
    {
        info!(?trigger, files = paths.len(), "transfer trigger recognized");
        self.cancel.store(false, Ordering::Relaxed);

        let mut io = SessionIo::new(remote_in, remote_out, trigger.variant.wire_format());
        io.push_residual(detector.take_residual());

        let mut session = TransferSession::new(io, &self.config, Arc::clone(&self.cancel))
            .with_cols(self.resize.subscribe())
            .with_terminal(local_out);
        if let Some(connector) = &self.connector {
            session = session.with_connector(Arc::clone(connector));
        }

        let mut key_buf = [0u8; 256];
        let mut deferred: Vec<SessionCommand> = Vec::new();
        let result = {
            let fut = session.initiate(trigger, paths);
            tokio::pin!(fut);
            loop {
                tokio::select! {
                    result = &mut fut => break result,
                    n = local_in.read(&mut key_buf), if local_open => {
                        // Keystrokes are swallowed during a session;
                        // Ctrl-C requests cancellation.
                        if let Ok(n) = n
                            && key_buf[..n].contains(&CTRL_C)
                        {
                            self.cancel.store(true, Ordering::Relaxed);
                        }
                    }
                    cmd = self.cmd_rx.recv() => {
                        match cmd {
                            Some(SessionCommand::Cancel) => {
                                self.cancel.store(true, Ordering::Relaxed);
                            }
                            Some(other) => deferred.push(other),
                            None => {}
                        }
                    }
                }
            }
        };
        let leftover = session.take_buffered();
        drop(session);

        // Commands that raced the session apply now.
        for cmd in deferred {
            match cmd {
                SessionCommand::Upload(paths) => {
                    let _ = self.cmd_tx.send(SessionCommand::Upload(paths));
                }
                SessionCommand::SetOptions(config) => self.config = *config,
                SessionCommand::Cancel => {}
            }
        }
        self.cancel.store(false, Ordering::Relaxed);

        match result {
            Ok(summary) => {
                info!(
                    files_ok = summary.files_ok,
                    files_failed = summary.files_failed,
                    bytes = summary.bytes,
                    "transfer session complete"
                );
                Ok(leftover)
            }
            Err(e) if e.is_session_fatal() && matches!(e, Error::StreamClosed | Error::Io(_)) => {
                Err(e)
            }
            Err(e) => {
                // Session-level failure: surface one line, resume relay.
                warn!(error = %e, "transfer session aborted");
                local_out.write_all(b"\r\x1b[K").await?;
                local_out
                    .write_all(format!("txf: transfer aborted: {e}\r\n").as_bytes())
                    .await?;
                local_out.flush().await?;
                Ok(leftover)
            }
        }
    }
}
