use std::io;
use thiserror::Error;

/// Custom error types for the wirebus stack
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("out of buffers")]
    OutOfMemory,

    #[error("buffer capacity exceeded: {0}")]
    Overflow(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("bus collision")]
    Collision,

    #[error("address conflict: {0}")]
    AddressConflict(String),

    #[error("timeout waiting for acknowledgement")]
    Timeout,

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("session disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new overflow error
    pub fn overflow(msg: impl Into<String>) -> Self {
        Error::Overflow(msg.into())
    }

    /// Creates a new address conflict error
    pub fn address_conflict(msg: impl Into<String>) -> Self {
        Error::AddressConflict(msg.into())
    }

    /// Creates a new remote error
    pub fn remote(msg: impl Into<String>) -> Self {
        Error::RemoteError(msg.into())
    }

    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }
}
