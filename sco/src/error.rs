//! Errors crossing the SCO session boundary.
//!
//! Framing and decode faults are recovered inside the session and never show
//! up here. What remains is caller misuse and socket failures, which end the
//! session.

use std::io;
use thiserror::Error;

/// Result alias for SCO operations.
pub type Result<T> = std::result::Result<T, ScoError>;

/// Errors reported by [`crate::ScoSession`] and its collaborators.
#[derive(Error, Debug)]
pub enum ScoError {
    /// Call not valid in the session's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The socket accepted fewer bytes than one packet.
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    /// The socket returned a packet of unexpected length.
    #[error("short read: received {received} bytes, expected {expected}")]
    ShortRead { received: usize, expected: usize },

    /// A wideband packet size outside the supported table.
    #[error("unsupported wideband packet size {0}")]
    UnsupportedPacketSize(usize),

    /// The frame encoder rejected a block.
    #[error("codec error: {0}")]
    Codec(String),

    /// Socket failure other than an interrupted call.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn io_errors_convert() {
        // ---
        let err = ScoError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, ScoError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn messages_name_sizes() {
        // ---
        let err = ScoError::ShortRead { received: 24, expected: 60 };
        assert_eq!(err.to_string(), "short read: received 24 bytes, expected 60");
    }
}
