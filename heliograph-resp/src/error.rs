//! RESP protocol and transport errors.

use std::io;
use thiserror::Error;

/// Errors produced by the codec and the blocking connection.
#[derive(Debug, Error)]
pub enum RespError {
    /// I/O error on the underlying stream (includes timeouts)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection
    #[error("connection closed by peer")]
    Eof,

    /// Malformed reply data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command could not be encoded
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
}

/// Result type alias for RESP operations
pub type Result<T> = std::result::Result<T, RespError>;

impl RespError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for the transport categories a caller may recover from by
    /// reconnecting: an I/O failure or a peer EOF. Protocol and encoding
    /// errors are not retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Eof)
    }
}
