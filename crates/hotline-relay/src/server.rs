//! Relay server implementation.
//!
//! The server listens on a single TCP endpoint (default `0.0.0.0:5001`),
//! runs one supervised handler task per accepted connection and stops
//! accepting when the shutdown coordinator's stop token fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hotline_shutdown::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::connection::{ConnectionActor, RelayContext};
use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::types::KeyMode;
use crate::RelayError;

/// Pause after a failed `accept` so a persistent error (e.g. fd
/// exhaustion) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind (default: 0.0.0.0:5001)
    pub listen_addr: SocketAddr,
    /// How client keys are established (default: peer IP)
    pub key_mode: KeyMode,
    /// Longest accepted frame in bytes, terminator excluded (default: 4096)
    pub max_frame_length: usize,
    /// Concurrent connection limit; extra connections are closed on accept (default: 1024)
    pub max_connections: usize,
    /// Outbound queue capacity per connection, in frames (default: 64)
    pub outbound_queue: usize,
    /// Close a connection after this long without an inbound frame (default: never)
    pub idle_timeout: Option<Duration>,
    /// Longest a sender waits for room in a recipient's queue (default: 2s)
    pub forward_timeout: Duration,
    /// Longest a single socket write may take (default: 5s)
    pub write_timeout: Duration,
    /// Time allowed for the naming handshake (default: 10s)
    pub handshake_timeout: Duration,
    /// Time a closing connection gets to flush queued frames (default: 1s)
    pub flush_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            key_mode: KeyMode::PeerIp,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_connections: 1024,
            outbound_queue: 64,
            idle_timeout: None,
            forward_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_frame_length == 0 {
            return Err(RelayError::config("max_frame_length must be greater than 0"));
        }
        check_count("max_connections", self.max_connections)?;
        check_count("outbound_queue", self.outbound_queue)?;
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(RelayError::config(
                "idle_timeout must be greater than 0 when set",
            ));
        }
        for (name, timeout) in [
            ("forward_timeout", self.forward_timeout),
            ("write_timeout", self.write_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("flush_timeout", self.flush_timeout),
        ] {
            if timeout.is_zero() {
                return Err(RelayError::config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }
}

/// Counts backed by a semaphore or channel must fit tokio's permit limit.
fn check_count(name: &str, value: usize) -> Result<(), RelayError> {
    if value == 0 {
        return Err(RelayError::config(format!("{} must be greater than 0", name)));
    }
    if value > Semaphore::MAX_PERMITS {
        return Err(RelayError::config(format!(
            "{} must be at most {}",
            name,
            Semaphore::MAX_PERMITS
        )));
    }
    Ok(())
}

/// Relay server instance.
pub struct RelayServer {
    context: Arc<RelayContext>,
}

impl RelayServer {
    /// Create a new relay server.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            context: Arc::new(RelayContext::new(config)),
        })
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let listener = TcpListener::bind(self.context.config.listen_addr).await?;
        Ok(listener)
    }

    /// Get the server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.context.config
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.context.registry
    }

    /// Accept connections until `shutdown` stops the server.
    ///
    /// After the stop token fires, every handler is closing; they get the
    /// coordinator's drain timeout to finish before being aborted.
    pub async fn run(self, listener: TcpListener, shutdown: GracefulShutdown) -> Result<(), RelayError> {
        let addr = listener.local_addr()?;
        let stop = shutdown.stop_token();
        let limiter = Arc::new(Semaphore::new(self.context.config.max_connections));
        let mut handlers = JoinSet::new();

        info!(
            addr = %addr,
            key_mode = %self.context.config.key_mode,
            max_connections = self.context.config.max_connections,
            "Relay server listening"
        );

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,

                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "Connection handler panicked");
                        }
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                            continue;
                        }
                    };

                    let permit = match Arc::clone(&limiter).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                            metrics::record_connection_rejected("limit");
                            drop(stream);
                            continue;
                        }
                    };

                    let guard = shutdown.connection_guard();
                    let context = Arc::clone(&self.context);
                    let stop = stop.clone();

                    handlers.spawn(
                        async move {
                            let _permit = permit;
                            let _guard = guard;
                            if let Err(e) =
                                ConnectionActor::handle_connection(stream, peer_addr, context, stop).await
                            {
                                warn!(error = %e, "Connection error");
                            }
                        }
                        .instrument(info_span!(
                            "relay.connection.lifecycle",
                            client_ip = %peer_addr,
                            transport = "tcp",
                        )),
                    );
                }
            }
        }

        drop(listener);
        info!(
            active_connections = shutdown.active_connections(),
            "Stopped accepting connections"
        );

        if !shutdown.drain().await {
            warn!(remaining = handlers.len(), "Aborting connections that did not drain");
            handlers.abort_all();
        }
        while handlers.join_next().await.is_some() {}

        info!("Relay server stopped");
        Ok(())
    }
}
