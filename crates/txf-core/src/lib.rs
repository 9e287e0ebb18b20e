//! txf-core: transparent terminal stream filter with embedded file
//! transfer.
//!
//! This crate provides:
//! - A relay that passes terminal traffic through unmodified
//! - Inline trigger detection for the native and legacy markers
//! - Protocol message definitions and wire format codecs
//! - The chunked, checksummed transfer session engine
//! - Single-line progress rendering that coexists with the terminal
//! - Side-channel tunnel abstractions (transport supplied by the caller)
//! - Logging setup

pub mod checksum;
pub mod compress;
pub mod config;
pub mod constants;
pub mod detect;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod progress;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod terminal;
pub mod tunnel;

pub use config::{FilterConfig, Rgb, TransferConfig};
pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use progress::TransferSummary;
pub use relay::{FilterHandle, StreamFilter};
