//! Crate-level error type
//!
//! Each subsystem has its own error enum; this wraps them for callers that
//! drive the relay end to end (the binary and the HTTP server).

use crate::relay::RelayError;

/// Top-level error for relay operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The relay event loop rejected or dropped a request
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
