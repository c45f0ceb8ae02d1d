//! Per-connection handler.
//!
//! Each accepted socket gets one handler task and one writer task:
//!
//! - the handler owns the read half, identifies the client, registers its
//!   [`ClientHandle`] and routes every inbound frame;
//! - the writer owns the write half and drains the connection's outbound
//!   queue, so all writes to the socket come from one place.
//!
//! Lifecycle: `Accepted → Active → Closing → Closed`. Closing is driven by
//! a [`Registration`] guard, so deregistration happens exactly once even if
//! the handler task is aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, instrument, warn};

use crate::codec::{CodecError, FrameCodec};
use crate::protocol::{self, INVALID_NAME};
use crate::registry::{ClientHandle, ConnectionRegistry, OutboundFrame, SendResult};
use crate::routing::Router;
use crate::server::RelayConfig;
use crate::types::{ClientKey, CloseReason, ConnectionState, KeyMode};
use crate::RelayError;

type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

/// State shared by every connection of one server.
#[derive(Debug)]
pub(crate) struct RelayContext {
    pub(crate) config: RelayConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) router: Router,
}

impl RelayContext {
    pub(crate) fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Router::new(Arc::clone(&registry), config.forward_timeout);
        Self {
            config,
            registry,
            router,
        }
    }
}

/// Outcome of the optional naming handshake.
enum Handshake {
    Accepted(ClientKey),
    Rejected,
    Abandoned(CloseReason),
}

/// Owns a registry entry for the lifetime of one connection.
///
/// Dropping it performs the Closing transition: the entry is removed if it
/// still belongs to this connection and the handle is closed, which tells
/// the writer to flush and shut down.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    handle: ClientHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.handle.key(), &self.handle);
        self.handle.close();
    }
}

/// Handler managing a single relay connection.
pub(crate) struct ConnectionActor {
    peer_addr: SocketAddr,
    state: ConnectionState,
    context: Arc<RelayContext>,
}

impl ConnectionActor {
    /// Handle a new incoming connection until it closes.
    #[instrument(
        name = "relay.connection.handle",
        skip(stream, peer_addr, context, stop),
        fields(peer = %peer_addr, key = tracing::field::Empty)
    )]
    pub(crate) async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        context: Arc<RelayContext>,
        stop: CancellationToken,
    ) -> Result<(), RelayError> {
        debug!("New connection from {}", peer_addr);

        let mut actor = Self {
            peer_addr,
            state: ConnectionState::Accepted,
            context,
        };

        actor.run(stream, stop).await
    }

    async fn run(&mut self, stream: TcpStream, stop: CancellationToken) -> Result<(), RelayError> {
        let context = Arc::clone(&self.context);
        let config = &context.config;
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::new(config.max_frame_length));
        let mut sink = FramedWrite::new(write_half, FrameCodec::new(config.max_frame_length));

        let key = match config.key_mode {
            KeyMode::PeerIp => ClientKey::from_peer_ip(self.peer_addr.ip()),
            KeyMode::Handshake => match self.read_handshake(&mut frames, &stop).await {
                Handshake::Accepted(key) => key,
                Handshake::Rejected => {
                    sink.send(OutboundFrame::new(INVALID_NAME)).await?;
                    sink.close().await?;
                    self.state = ConnectionState::Closed;
                    return Ok(());
                }
                Handshake::Abandoned(reason) => {
                    debug!(%reason, "Connection closed during handshake");
                    self.state = ConnectionState::Closed;
                    return Ok(());
                }
            },
        };
        tracing::Span::current().record("key", tracing::field::display(&key));

        let (tx, rx) = mpsc::channel(config.outbound_queue);
        let handle = ClientHandle::new(key.clone(), tx);
        let mut writer = spawn_writer(sink, rx, handle.liveness_token(), config.write_timeout);

        let registration = Registration {
            registry: Arc::clone(&context.registry),
            handle: handle.clone(),
        };
        context.registry.register(handle.clone());

        if config.key_mode == KeyMode::Handshake {
            let greeting = OutboundFrame::new(protocol::welcome(&key));
            if handle.deliver(greeting, config.forward_timeout).await != SendResult::Sent {
                warn!("Could not queue welcome frame");
            }
        }

        self.state = ConnectionState::Active;
        info!(key = %key, "Client connected");

        let reason = self.process_frames(&mut frames, &handle, &stop).await;

        self.state = ConnectionState::Closing;
        drop(handle);
        drop(registration);
        drop(frames);

        let flush_timeout = config.flush_timeout;
        if tokio::time::timeout(flush_timeout, &mut writer).await.is_err() {
            warn!(
                timeout_ms = flush_timeout.as_millis() as u64,
                "Writer did not finish in time, aborting"
            );
            writer.abort();
        }

        self.state = ConnectionState::Closed;
        info!(key = %key, %reason, "Client disconnected");
        Ok(())
    }

    /// Read the client's chosen name.
    async fn read_handshake(&self, frames: &mut FrameReader, stop: &CancellationToken) -> Handshake {
        let timeout = self.context.config.handshake_timeout;
        let next = tokio::select! {
            _ = stop.cancelled() => return Handshake::Abandoned(CloseReason::Shutdown),
            next = tokio::time::timeout(timeout, frames.next()) => next,
        };

        match next {
            Err(_) => Handshake::Abandoned(CloseReason::HandshakeTimeout),
            Ok(None) => Handshake::Abandoned(CloseReason::EndOfStream),
            Ok(Some(Err(e))) => Handshake::Abandoned(close_reason(e)),
            Ok(Some(Ok(frame))) => match protocol::parse_handshake(&frame) {
                Ok(key) => Handshake::Accepted(key),
                Err(e) => {
                    debug!(error = %e, "Rejecting handshake");
                    Handshake::Rejected
                }
            },
        }
    }

    /// Route frames until the connection should close.
    async fn process_frames(
        &self,
        frames: &mut FrameReader,
        handle: &ClientHandle,
        stop: &CancellationToken,
    ) -> CloseReason {
        let idle_timeout = self.context.config.idle_timeout;
        debug_assert_eq!(self.state, ConnectionState::Active);

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => return CloseReason::Shutdown,
                _ = handle.closed() => return CloseReason::HandleClosed,
                next = next_frame(frames, idle_timeout) => next,
            };

            match next {
                Err(_) => return CloseReason::IdleTimeout,
                Ok(None) => return CloseReason::EndOfStream,
                Ok(Some(Err(e))) => {
                    if let CodecError::FrameTooLong { max } = &e {
                        warn!(max, "Closing connection after oversized frame");
                    }
                    return close_reason(e);
                }
                Ok(Some(Ok(frame))) => {
                    self.context.router.route(handle, &frame).await;
                }
            }
        }
    }
}

/// Wait for the next frame, bounded by the idle timeout if one is set.
async fn next_frame(
    frames: &mut FrameReader,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<BytesMut, CodecError>>, tokio::time::error::Elapsed> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, frames.next()).await,
        None => Ok(frames.next().await),
    }
}

fn close_reason(error: CodecError) -> CloseReason {
    match error {
        CodecError::FrameTooLong { .. } => CloseReason::FrameTooLong,
        CodecError::Io(e) => CloseReason::ReadError(e.to_string()),
    }
}

/// Start the connection's writer task.
///
/// The task is aborted when the returned handle is dropped, so aborting the
/// handler also stops a writer stuck on a slow socket.
fn spawn_writer<S>(
    sink: S,
    rx: mpsc::Receiver<OutboundFrame>,
    liveness: CancellationToken,
    write_timeout: Duration,
) -> AbortOnDropHandle<()>
where
    S: Sink<OutboundFrame, Error = CodecError> + Unpin + Send + 'static,
{
    AbortOnDropHandle::new(tokio::spawn(write_loop(sink, rx, liveness, write_timeout)))
}

/// Drain the outbound queue onto the socket.
///
/// Runs until every sender is gone. Once `liveness` is cancelled the queue
/// is closed to new frames and whatever is already buffered is flushed.
/// A failed or stalled write cancels `liveness` so the handler closes too.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<OutboundFrame>,
    liveness: CancellationToken,
    write_timeout: Duration,
) where
    S: Sink<OutboundFrame, Error = CodecError> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = liveness.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        let Some(frame) = frame else { break };

        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write failed");
                liveness.cancel();
                return;
            }
            Err(_) => {
                warn!(
                    timeout_ms = write_timeout.as_millis() as u64,
                    "Write timed out, dropping connection"
                );
                liveness.cancel();
                return;
            }
        }
    }

    if let Ok(Err(e)) = tokio::time::timeout(write_timeout, sink.close()).await {
        debug!(error = %e, "Failed to shut down write half");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tracing::span::{Attributes, Id};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    /// Collects the field names declared on the handler span.
    #[derive(Clone, Default)]
    struct HandlerSpanFields(Arc<Mutex<Vec<String>>>);

    impl<S: Subscriber> Layer<S> for HandlerSpanFields {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
            if attrs.metadata().name() == "relay.connection.handle" {
                self.0
                    .lock()
                    .unwrap()
                    .extend(attrs.metadata().fields().iter().map(|f| f.name().to_string()));
            }
        }
    }

    #[tokio::test]
    async fn test_handler_span_records_peer_once() {
        let fields = HandlerSpanFields::default();
        let subscriber = tracing_subscriber::registry().with(fields.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let (client, server, peer) = socket_pair().await;
        drop(client);
        let context = Arc::new(RelayContext::new(RelayConfig::default()));
        ConnectionActor::handle_connection(server, peer, context, CancellationToken::new())
            .await
            .unwrap();

        let names = fields.0.lock().unwrap().clone();
        assert_eq!(names, vec!["peer".to_string(), "key".to_string()]);
    }

    #[tokio::test]
    async fn test_silent_client_hits_handshake_timeout() {
        let (_client, server, peer) = socket_pair().await;
        let config = RelayConfig {
            key_mode: KeyMode::Handshake,
            handshake_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        };
        let actor = ConnectionActor {
            peer_addr: peer,
            state: ConnectionState::Accepted,
            context: Arc::new(RelayContext::new(config)),
        };
        let (read_half, _write_half) = server.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::default());

        let outcome = actor
            .read_handshake(&mut frames, &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            Handshake::Abandoned(CloseReason::HandshakeTimeout)
        ));
    }

    #[tokio::test]
    async fn test_aborting_owner_stops_stalled_writer() {
        // A tiny pipe nobody reads from, so the first write never completes.
        let (_peer, transport) = tokio::io::duplex(16);
        let sink = FramedWrite::new(transport, FrameCodec::default());
        let (tx, rx) = mpsc::channel(8);
        for _ in 0..4 {
            tx.send(OutboundFrame::new("x".repeat(64))).await.unwrap();
        }

        let owner = tokio::spawn(async move {
            let _writer = spawn_writer(sink, rx, CancellationToken::new(), Duration::from_secs(60));
            std::future::pending::<()>().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tx.is_closed());

        owner.abort();
        let _ = owner.await;

        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("writer outlived its owner");
    }
}
