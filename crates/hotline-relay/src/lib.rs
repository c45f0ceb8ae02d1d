//! # hotline-relay
//!
//! Line-oriented TCP message relay.
//!
//! Clients connect over TCP and send newline-terminated frames of the form
//! `<recipientKey>:<content>`. The relay forwards each one to the connected
//! client registered under `recipientKey` as `From <senderKey>: <content>`,
//! or answers the sender with `Recipient not found.`.
//!
//! ## Architecture
//!
//! - **Server**: TCP listener with a supervised handler task per connection
//! - **Registry**: concurrent map from [`ClientKey`] to [`ClientHandle`]
//! - **Writer Tasks**: one per connection, draining a bounded outbound queue
//! - **Router**: parses frames and forwards them through the registry
//!
//! Client keys are either the peer IP address ([`KeyMode::PeerIp`]) or a
//! name chosen in a one-line handshake ([`KeyMode::Handshake`]).

pub mod codec;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod server;

mod connection;
mod error;
mod types;

pub use error::RelayError;
pub use hotline_shutdown::GracefulShutdown;
pub use registry::{ClientHandle, ConnectionRegistry, OutboundFrame, SendResult};
pub use routing::{Router, RoutingOutcome};
pub use server::{RelayConfig, RelayServer};
pub use types::*;
