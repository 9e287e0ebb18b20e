//! Filter and transfer configuration.
//!
//! `FilterConfig` is the outward configuration surface: settable at any
//! time, consumed at the next negotiation. `TransferConfig` is the
//! negotiated per-session configuration: exchanged on the wire during
//! negotiation and immutable for the session's lifetime once agreed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_COLS, PROTOCOL_VERSION};
use crate::protocol::{ProtocolVariant, TransferDirection};

/// A 24-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Linear interpolation between two colors, `t` in 0.0..=1.0.
    pub fn lerp(self, other: Rgb, t: f64) -> Rgb {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
        Rgb(mix(self.0, other.0), mix(self.1, other.1), mix(self.2, other.2))
    }
}

/// Outward configuration surface of the filter.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Terminal column count used until a size source reports otherwise.
    pub cols: u16,
    /// Default directory offered as the upload source.
    pub upload_dir: Option<PathBuf>,
    /// Directory downloaded files are written into.
    pub download_dir: PathBuf,
    /// Command template for drag-triggered uploads; `{}` is replaced with
    /// the space-joined file list.
    pub drag_command: Option<String>,
    /// Two colors defining the progress bar gradient.
    pub progress_colors: Option<(Rgb, Rgb)>,
    /// Whether side-channel tunneling is permitted.
    pub tunnel: bool,
    /// Whether clipboard escape sequences pass through unmodified. When
    /// false, OSC 52 clipboard writes from the remote side are dropped
    /// before they reach the local terminal.
    pub clipboard_passthrough: bool,
    /// Request compressed chunk payloads when the peer supports it.
    pub compress: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            upload_dir: None,
            download_dir: PathBuf::from("."),
            drag_command: None,
            progress_colors: None,
            tunnel: true,
            clipboard_passthrough: true,
            compress: false,
        }
    }
}

impl FilterConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial terminal column count.
    pub fn with_cols(mut self, cols: u16) -> Self {
        self.cols = cols;
        self
    }

    /// Set the download destination directory.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Set the default upload source directory.
    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    /// Set the progress gradient colors.
    pub fn with_progress_colors(mut self, from: Rgb, to: Rgb) -> Self {
        self.progress_colors = Some((from, to));
        self
    }

    /// Enable or disable side-channel tunneling.
    pub fn with_tunnel(mut self, enabled: bool) -> Self {
        self.tunnel = enabled;
        self
    }

    /// Request compression for negotiated sessions.
    pub fn with_compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    /// Allow or drop remote OSC 52 clipboard writes.
    pub fn with_clipboard_passthrough(mut self, enabled: bool) -> Self {
        self.clipboard_passthrough = enabled;
        self
    }

    /// Render the drag-upload command for a set of paths, if a template
    /// is configured.
    pub fn drag_upload_command(&self, paths: &[PathBuf]) -> Option<String> {
        let template = self.drag_command.as_deref()?;
        let joined = paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Some(template.replace("{}", &joined))
    }
}

/// Negotiated per-session configuration.
///
/// Built by the initiating side from its `FilterConfig` and the trigger
/// parameters, confirmed by the peer, then immutable for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Protocol version both sides agreed on.
    pub version: u8,
    /// Protocol variant selected by the trigger.
    pub variant: ProtocolVariant,
    /// Transfer direction from the initiator's perspective.
    pub direction: TransferDirection,
    /// Terminal column count at negotiation time; sizes legacy frames.
    pub cols: u16,
    /// Whether chunk payloads may be compressed.
    pub compress: bool,
    /// Destination directory on the receiving side, informational.
    pub dest_dir: String,
    /// Port the peer listens on for a side-channel tunnel, if offered.
    pub tunnel_port: Option<u16>,
    /// Convert line endings for text transfers. Resolved at negotiation,
    /// never a process-wide flag.
    pub crlf: bool,
}

impl TransferConfig {
    /// Build a session config from the filter's outward configuration.
    pub fn from_filter(
        config: &FilterConfig,
        variant: ProtocolVariant,
        direction: TransferDirection,
        cols: u16,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            variant,
            direction,
            cols,
            compress: config.compress,
            dest_dir: config.download_dir.display().to_string(),
            tunnel_port: None,
            crlf: false,
        }
    }
}
