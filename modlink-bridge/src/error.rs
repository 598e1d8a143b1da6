//! Error types for the device link.

use std::time::Duration;

use thiserror::Error;

/// A connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Host name did not resolve to any address.
    #[error("Could not resolve '{0}'")]
    Resolve(String),

    /// No answer within the connect timeout.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Endpoint refused or dropped the connection.
    #[error("Connection failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A range read failed.
///
/// Variants are either partial (the session is still usable and only this
/// range keeps its previous values) or fatal (the session is gone and must be
/// re-established). See [`ReadError::is_fatal`].
#[derive(Debug, Error)]
pub enum ReadError {
    /// No response within the read timeout.
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    /// The device answered with an exception code.
    #[error("Device exception: {0}")]
    Exception(String),

    /// The device answered with the wrong number of registers.
    #[error("Expected {expected} registers, got {actual}")]
    ShortResponse { expected: usize, actual: usize },

    /// There is no open session.
    #[error("Link is not open")]
    NotConnected,

    /// Transport or framing failure; the session cannot be trusted anymore.
    #[error("Transport failure: {0}")]
    Transport(String),
}

impl ReadError {
    /// Whether this failure means the session itself is dead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::NotConnected | ReadError::Transport(_))
    }
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Closing the session failed. Always best-effort: logged, never propagated
/// past the caller that closes.
#[derive(Debug, Error)]
pub enum CloseError {
    #[error("Close timed out after {0:?}")]
    Timeout(Duration),

    #[error("Close failed: {0}")]
    Io(#[from] std::io::Error),
}
