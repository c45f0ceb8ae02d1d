//! Connection Registry for point-to-point message routing.
//!
//! This module provides a thread-safe registry that tracks active relay
//! connections by their [`ClientKey`](crate::ClientKey), enabling any
//! handler to forward frames to any other connected client.
//!
//! ## Architecture
//!
//! Each connection registers a [`ClientHandle`] once its key is known. The
//! handle carries the sending half of that connection's bounded outbound
//! queue; a single writer task per connection drains the queue onto the
//! socket, so no two contexts ever write to the same transport.
//!
//! ```text
//! Handler (alice) --> ConnectionRegistry --> ClientHandle (bob) --> mpsc --> writer task (bob) --> socket
//!                       DashMap<ClientKey,
//!                               ClientHandle>
//! ```

mod connection_registry;

pub use connection_registry::{ClientHandle, ConnectionRegistry, OutboundFrame, SendResult};
