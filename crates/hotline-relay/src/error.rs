//! Error types for the relay.

use thiserror::Error;

use crate::codec::CodecError;

/// Relay errors.
///
/// Errors raised inside one connection handler end that handler only; they
/// are logged by the accept loop and never stop the server.
#[derive(Debug, Error)]
pub enum RelayError {
    /// IO error (bind, accept, socket)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
