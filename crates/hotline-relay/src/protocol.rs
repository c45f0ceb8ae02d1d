//! Wire protocol.
//!
//! Every frame is one UTF-8 line. Clients send `<recipientKey>:<content>`;
//! the split happens on the first `:` only, so content may contain more of
//! them. The server sends back either a forwarded message
//! (`From <senderKey>: <content>`) or [`RECIPIENT_NOT_FOUND`].
//!
//! In handshake mode the first client frame is a bare name, answered with
//! `Welcome, <name>.` or [`INVALID_NAME`].

use thiserror::Error;

use crate::types::ClientKey;

/// Separates the recipient key from the content.
pub const SEPARATOR: char = ':';

/// Sent to a client whose recipient is not connected.
pub const RECIPIENT_NOT_FOUND: &str = "Recipient not found.";

/// Sent before closing a connection whose handshake name was rejected.
pub const INVALID_NAME: &str = "Invalid name.";

/// Per-frame protocol errors. None of them end the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame bytes are not UTF-8
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// No `:` in the frame
    #[error("frame has no recipient separator")]
    MissingSeparator,

    /// Handshake name failed validation
    #[error("invalid client name: {0:?}")]
    InvalidKey(String),
}

impl ProtocolError {
    /// Short label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolError::InvalidUtf8 => "invalid_utf8",
            ProtocolError::MissingSeparator => "missing_separator",
            ProtocolError::InvalidKey(_) => "invalid_key",
        }
    }
}

/// A parsed client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayMessage<'a> {
    /// Key of the client the content is addressed to
    pub recipient: &'a str,
    /// Everything after the first separator, unchanged
    pub content: &'a str,
}

/// Parse one frame (without its line terminator).
pub fn parse_frame(frame: &[u8]) -> Result<RelayMessage<'_>, ProtocolError> {
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
    let (recipient, content) = text
        .split_once(SEPARATOR)
        .ok_or(ProtocolError::MissingSeparator)?;
    Ok(RelayMessage { recipient, content })
}

/// Parse a handshake frame into the client's chosen key.
pub fn parse_handshake(frame: &[u8]) -> Result<ClientKey, ProtocolError> {
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
    ClientKey::parse(text)
}

/// Render the frame delivered to a recipient.
pub fn forwarded(sender: &ClientKey, content: &str) -> String {
    format!("From {}: {}", sender, content)
}

/// Render the handshake acknowledgement.
pub fn welcome(key: &ClientKey) -> String {
    format!("Welcome, {}.", key)
}
