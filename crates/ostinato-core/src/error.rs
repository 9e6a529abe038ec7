//! Error types for ostinato-core.

use thiserror::Error;

/// Error type for engine operations.
///
/// Audio-thread paths downgrade most of these to "skip the rest of the
/// block"; only [`Error::ProtocolViolation`] is treated as fatal.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("channel '{0}' written multiple times")]
    DuplicateChannel(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("hand-off protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
