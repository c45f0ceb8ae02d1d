//! Graceful shutdown coordinator.
//!
//! Provides signal-driven shutdown with connection draining:
//! - `SIGINT` / `SIGTERM` → stop accepting, close handlers, drain, exit
//!
//! Uses `CancellationToken` for coordination and `ConnectionGuard` for drain tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Signal indicating why shutdown was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// Shutdown requested from code via [`GracefulShutdown::trigger_stop`].
    Requested,
}

/// Tracks an active connection for drain coordination.
///
/// The coordinator waits for all `ConnectionGuard`s to drop before
/// considering drain complete.
#[derive(Clone)]
pub struct ConnectionGuard {
    _drop_notifier: Arc<DropNotifier>,
}

struct DropNotifier {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for DropNotifier {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Coordinator for graceful shutdown with connection draining.
///
/// Cloning is cheap; all clones share the same token and counter.
#[derive(Clone)]
pub struct GracefulShutdown {
    /// Token cancelled when the server should stop accepting new connections.
    stop_accepting: CancellationToken,

    /// Active connection counter.
    connection_count: Arc<AtomicUsize>,

    /// Notified when the last connection drains.
    drain_notify: Arc<Notify>,

    /// Drain timeout.
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new shutdown coordinator.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            connection_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
            drain_timeout,
        }
    }

    /// Get a `CancellationToken` that fires when the accept loop should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    /// Whether the stop phase has begun.
    pub fn is_stopping(&self) -> bool {
        self.stop_accepting.is_cancelled()
    }

    /// The configured drain timeout.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Create a `ConnectionGuard` for a new connection.
    ///
    /// Increments the counter on creation, decrements on drop.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            _drop_notifier: Arc::new(DropNotifier {
                counter: Arc::clone(&self.connection_count),
                notify: Arc::clone(&self.drain_notify),
            }),
        }
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Wait for SIGINT or (on Unix) SIGTERM.
    ///
    /// If a handler cannot be installed the corresponding signal is ignored
    /// and a warning is logged; the other one still works.
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to register SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => {
                info!("Received SIGINT, initiating graceful shutdown");
                ShutdownSignal::Interrupt
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown");
                ShutdownSignal::Terminate
            }
            _ = self.stop_accepting.cancelled() => ShutdownSignal::Requested,
        }
    }

    /// Wait for a signal, then cancel the stop token.
    pub async fn stop_on_signal(&self) -> ShutdownSignal {
        let signal = self.wait_for_signal().await;
        info!(?signal, "Stopping accept loops");
        self.stop_accepting.cancel();
        signal
    }

    /// Trigger the stop phase programmatically.
    pub fn trigger_stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Run the drain phase: wait for all connections to complete or timeout.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn drain(&self) -> bool {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "Draining active connections"
        );

        tokio::select! {
            _ = self.wait_for_drain() => {
                info!("All connections drained cleanly");
                true
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    remaining_connections = self.active_connections(),
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Drain timeout expired"
                );
                false
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            // Register interest before checking so a drop in between is not missed.
            let notified = self.drain_notify.notified();
            if self.connection_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
