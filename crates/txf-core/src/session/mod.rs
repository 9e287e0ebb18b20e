//! Transfer session: lifecycle state and the streaming engines.

mod state;
mod transfer;

pub use state::{SessionCommand, SessionState};
pub use transfer::{SessionIo, TransferSession};
