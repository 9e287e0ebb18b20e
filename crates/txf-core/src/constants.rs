//! Protocol and configuration constants for txf.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Native trigger marker prefix. A complete trigger line looks like
/// `::TXF:TRANSFER:<S|R>:<version>:<cols>` with nothing else on the line.
pub const NATIVE_MARKER_PREFIX: &str = "::TXF:TRANSFER:";

/// Legacy trigger line announcing the peer is about to send files.
pub const LEGACY_SEND_MARKER: &str = "**TXF:SEND**";

/// Legacy trigger line announcing the peer is waiting to receive files.
pub const LEGACY_RECV_MARKER: &str = "**TXF:RECV**";

/// Maximum control/data frame payload size (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Chunk payload size for the native protocol (32 KiB).
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Retry budget per chunk on checksum mismatch.
pub const MAX_CHUNK_RETRIES: u32 = 3;

// =============================================================================
// Detection Constants
// =============================================================================

/// A line longer than this is flushed as plain content without waiting for
/// a newline, bounding detector memory on streams without line breaks.
pub const MAX_TRIGGER_LINE: usize = 512;

// =============================================================================
// Timing Constants
// =============================================================================

/// Timeout for each control message exchange (negotiation, finish, tunnel
/// setup). Data chunk acknowledgments are not subject to this timeout.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace timeout waiting for the final acknowledgment before returning
/// the stream to passthrough.
pub const FINISH_GRACE: Duration = Duration::from_secs(3);

/// Minimum interval between progress line repaints.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Default Values
// =============================================================================

/// Default terminal columns when no size source is available.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal rows when no size source is available.
pub const DEFAULT_ROWS: u16 = 24;

/// Maximum terminal columns accepted from a size source.
pub const MAX_TERMINAL_COLS: u16 = 500;
