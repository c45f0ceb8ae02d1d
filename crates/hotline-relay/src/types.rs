//! Common types for the relay.

use std::borrow::Borrow;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use uuid::Uuid;

use crate::protocol::{ProtocolError, SEPARATOR};

/// Longest name a client may choose during the handshake.
pub const MAX_KEY_LENGTH: usize = 64;

/// Routing identifier for one connected client.
///
/// Keys never contain the wire separator (`:`), whitespace or control
/// characters, so `<key>:<content>` always splits unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(String);

impl ClientKey {
    /// Derive a key from a peer's IP address.
    ///
    /// IPv4 and IPv4-mapped IPv6 addresses use dotted-quad notation. Other
    /// IPv6 addresses have `:` replaced by `-` (`fe80::1` becomes `fe80--1`).
    pub fn from_peer_ip(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(v4) => Self(v4.to_string()),
            IpAddr::V6(v6) => Self(v6.to_string().replace(SEPARATOR, "-")),
        }
    }

    /// Validate a client-chosen name.
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        if name.is_empty() || name.chars().count() > MAX_KEY_LENGTH {
            return Err(ProtocolError::InvalidKey(name.to_string()));
        }
        if name
            .chars()
            .any(|c| c == SEPARATOR || c.is_whitespace() || c.is_control())
        {
            return Err(ProtocolError::InvalidKey(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identity of one accepted connection.
///
/// Two handles for the same [`ClientKey`] are told apart by this id, which
/// is what makes unregistering safe against a reconnect race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a connection's [`ClientKey`] is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    /// Key is the peer's IP address. Clients behind the same NAT collide.
    #[default]
    PeerIp,
    /// The first frame on the connection is the client's chosen name.
    Handshake,
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMode::PeerIp => write!(f, "peer_ip"),
            KeyMode::Handshake => write!(f, "handshake"),
        }
    }
}

impl FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "peer_ip" | "peer-ip" | "ip" => Ok(KeyMode::PeerIp),
            "handshake" | "name" => Ok(KeyMode::Handshake),
            other => Err(format!("unknown key mode: {}", other)),
        }
    }
}

/// Connection state in the handler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, key not yet registered
    Accepted,
    /// Registered and routing frames
    Active,
    /// Deregistering and flushing
    Closing,
    /// Done
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Accepted => write!(f, "accepted"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a connection left the Active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side.
    EndOfStream,
    /// Transport read failed.
    ReadError(String),
    /// A frame exceeded the configured maximum length.
    FrameTooLong,
    /// No frame arrived within the idle timeout.
    IdleTimeout,
    /// The client did not send its name within the handshake timeout.
    HandshakeTimeout,
    /// The handle was closed elsewhere: replaced by a newer registration
    /// for the same key, or its writer failed.
    HandleClosed,
    /// Server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::ReadError(e) => write!(f, "read error: {}", e),
            CloseReason::FrameTooLong => write!(f, "frame too long"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::HandshakeTimeout => write!(f, "handshake timeout"),
            CloseReason::HandleClosed => write!(f, "handle closed"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}
