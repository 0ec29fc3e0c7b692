//! Error types for the sync protocol core.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the protocol layer.
///
/// Transport I/O failures appear as `Codec` on the next read or write;
/// any error on the critical path closes the connection, so callers never
/// see the same failure twice.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The connection has transitioned to closed. Returned to all pending
    /// and future correlated calls.
    #[error("connection closed")]
    Closed,

    /// A framing or decoding failure on either direction.
    #[error("codec error: {0}")]
    Codec(#[from] std::io::Error),

    /// Unknown protocol version or message type.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// True if this error means the peer is gone rather than misbehaving.
    pub fn is_closed(&self) -> bool {
        matches!(self, SyncError::Closed)
    }
}
