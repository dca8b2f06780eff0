//! Engine error types.

use std::io;
use thiserror::Error;

/// Main error type for engine operations.
///
/// Reader I/O never surfaces here: per the delivery model, transport
/// failures on readers are recovered (or reported as an absent reply)
/// inside the reader itself, and writer-side issues stay behind the
/// eventual-delivery model.
#[derive(Debug, Error)]
pub enum Error {
    /// A command could not be encoded into a wire frame
    #[error("invalid command")]
    InvalidCommand,

    /// The event loop was started twice
    #[error("event loop already running")]
    AlreadyRunning,

    /// Configuration change attempted after the event loop started
    #[error("engine is running; configuration is frozen")]
    Running,

    /// Host file exceeds the 64 KiB cap
    #[error("host file too large: {0} bytes")]
    HostFileTooLarge(u64),

    /// A host line that could not be parsed at all
    #[error("invalid host line: {0:?}")]
    InvalidHost(String),

    /// I/O error (host file access, thread spawn, event loop setup)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
