//! Frame routing.
//!
//! The `Router` turns one inbound frame into at most one outbound frame:
//!
//! 1. Parse `<recipientKey>:<content>`; malformed frames are dropped silently
//! 2. Look the recipient up in the [`ConnectionRegistry`]
//! 3. If connected: queue `From <senderKey>: <content>` on the recipient
//! 4. If not: queue [`RECIPIENT_NOT_FOUND`] back on the sender
//!
//! # Ordering
//!
//! One handler routes its own frames one at a time and every outbound queue
//! is FIFO, so frames from one sender to one recipient arrive in the order
//! they were sent. Frames from different senders to the same recipient
//! interleave in whatever order they reach the recipient's queue; no
//! ordering is promised between them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::metrics;
use crate::protocol::{self, ProtocolError, RECIPIENT_NOT_FOUND};
use crate::registry::{ClientHandle, ConnectionRegistry, OutboundFrame, SendResult};

/// Result of routing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Queued on the recipient's connection
    Forwarded,
    /// Recipient not connected; the sender was told so
    RecipientNotFound,
    /// Frame could not be parsed and was dropped
    Malformed(ProtocolError),
    /// Recipient was found but its queue did not accept the frame
    DeliveryFailed(SendResult),
}

/// Routes parsed frames between registered connections.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    forward_timeout: Duration,
}

impl Router {
    /// Create a router over `registry`.
    ///
    /// `forward_timeout` bounds how long a sender waits for space in a
    /// recipient's outbound queue.
    pub fn new(registry: Arc<ConnectionRegistry>, forward_timeout: Duration) -> Self {
        Self {
            registry,
            forward_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Route one frame received from `sender`.
    ///
    /// Never fails: every problem is reported through the outcome and, at
    /// most, one frame back to the sender.
    pub async fn route(&self, sender: &ClientHandle, frame: &[u8]) -> RoutingOutcome {
        metrics::record_frame_received();

        let message = match protocol::parse_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(from = %sender.key(), error = %e, "Dropping malformed frame");
                metrics::record_frame_dropped(e.as_str());
                return RoutingOutcome::Malformed(e);
            }
        };

        let outbound = OutboundFrame::new(protocol::forwarded(sender.key(), message.content));
        match self
            .registry
            .send_to(message.recipient, outbound, self.forward_timeout)
            .await
        {
            SendResult::Sent => {
                debug!(from = %sender.key(), to = %message.recipient, "Forwarded message");
                metrics::record_frame_forwarded();
                RoutingOutcome::Forwarded
            }
            SendResult::NotConnected => {
                debug!(from = %sender.key(), to = %message.recipient, "Recipient not found");
                metrics::record_frame_dropped("recipient_not_found");
                let notice = OutboundFrame::new(RECIPIENT_NOT_FOUND);
                let reply = sender.deliver(notice, self.forward_timeout).await;
                if reply != SendResult::Sent {
                    warn!(to = %sender.key(), result = reply.as_str(), "Could not queue not-found notice");
                }
                RoutingOutcome::RecipientNotFound
            }
            failed => {
                warn!(
                    from = %sender.key(),
                    to = %message.recipient,
                    result = failed.as_str(),
                    "Forwarding failed"
                );
                metrics::record_frame_dropped(failed.as_str());
                RoutingOutcome::DeliveryFailed(failed)
            }
        }
    }
}
