//! Test utilities for relay integration testing.
//!
//! Provides helpers for starting a relay on an ephemeral port and driving
//! it with raw line-oriented TCP clients.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hotline_relay::{ConnectionRegistry, GracefulShutdown, KeyMode, RelayConfig, RelayServer};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client waits before concluding nothing is coming.
pub const SILENCE: Duration = Duration::from_millis(200);

/// Initialize tracing for tests.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("hotline_relay=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Config for tests: named clients, short timeouts.
pub fn handshake_config() -> RelayConfig {
    RelayConfig {
        key_mode: KeyMode::Handshake,
        forward_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_secs(2),
        ..RelayConfig::default()
    }
}

/// A relay server running on an ephemeral localhost port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    shutdown: GracefulShutdown,
    task: Option<JoinHandle<Result<(), hotline_relay::RelayError>>>,
}

impl TestServer {
    /// Start a test server with the default handshake config.
    pub async fn start() -> Self {
        Self::start_with_config(handshake_config()).await
    }

    /// Start a test server with a custom config.
    pub async fn start_with_config(config: RelayConfig) -> Self {
        Self::start_on(config, "127.0.0.1:0".parse().unwrap()).await
    }

    /// Start a test server bound to `bind_addr`.
    pub async fn start_on(config: RelayConfig, bind_addr: SocketAddr) -> Self {
        init_tracing();

        let listener = TcpListener::bind(bind_addr)
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let server = RelayServer::new(config).expect("Invalid test config");
        let registry = Arc::clone(server.registry());
        let shutdown = GracefulShutdown::new(Duration::from_secs(2));

        let task = tokio::spawn(server.run(listener, shutdown.clone()));

        Self {
            addr,
            registry,
            shutdown,
            task: Some(task),
        }
    }

    /// Connect a client and complete the naming handshake.
    pub async fn connect_named(&self, name: &str) -> RawClient {
        let mut client = RawClient::connect(self.addr).await;
        client.send_line(name).await;
        let welcome = client.read_line(DEFAULT_TIMEOUT).await;
        assert_eq!(welcome.as_deref(), Some(format!("Welcome, {}.", name).as_str()));
        client
    }

    /// Stop the server and wait for `run` to return.
    pub async fn stop(mut self) -> Result<(), hotline_relay::RelayError> {
        self.shutdown.trigger_stop();
        let task = self.task.take().expect("server already stopped");
        timeout(DEFAULT_TIMEOUT, task)
            .await
            .expect("Server did not stop in time")
            .expect("Server task panicked")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger_stop();
    }
}

/// Raw TCP client speaking the line protocol.
pub struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    /// Connect to a relay.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect to test server");
        Self::from_stream(stream)
    }

    /// Connect from a specific local IP address.
    pub async fn connect_from(local_ip: IpAddr, addr: SocketAddr) -> Self {
        let socket = if local_ip.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .expect("Failed to create socket");
        socket
            .bind(SocketAddr::new(local_ip, 0))
            .expect("Failed to bind client socket");
        let stream = socket
            .connect(addr)
            .await
            .expect("Failed to connect to test server");
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Send one newline-terminated frame.
    pub async fn send_line(&mut self, line: &str) {
        self.send_raw(format!("{}\n", line).as_bytes()).await;
    }

    /// Send bytes exactly as given.
    pub async fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.expect("Failed to send");
        self.writer.flush().await.expect("Failed to flush");
    }

    /// Read one line, without its terminator.
    ///
    /// Returns `None` on timeout, end of stream or a reset connection.
    pub async fn read_line(&mut self, timeout_dur: Duration) -> Option<String> {
        let mut line = String::new();
        match timeout(timeout_dur, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => None,
            Ok(Ok(_)) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    /// Assert that nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let mut line = String::new();
        match timeout(SILENCE, self.reader.read_line(&mut line)).await {
            Err(_) => {}
            Ok(Ok(0)) => panic!("Connection closed, expected it to stay open"),
            Ok(Ok(_)) => panic!("Unexpected frame: {:?}", line),
            Ok(Err(e)) => panic!("Read failed: {}", e),
        }
    }

    /// Assert that the server closes the connection.
    ///
    /// Frames still buffered ahead of the close are skipped.
    pub async fn expect_closed(&mut self) {
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.reader.read(&mut buf)).await {
                Err(_) => panic!("Connection was not closed"),
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(_)) => continue,
            }
        }
    }
}

/// Poll `condition` until it holds or the default timeout passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
