//! Server configuration.
//!
//! Settings are layered, later sources winning:
//!
//! 1. Built-in defaults
//! 2. A TOML file (`--config` or `HOTLINE_CONFIG`)
//! 3. `HOTLINE_*` environment variables
//! 4. Command-line flags
//!
//! Durations are whole seconds or milliseconds as the key name says.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use hotline_relay::{KeyMode, RelayConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// How clients are identified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum KeyModeSetting {
    /// Key each client by its IP address
    #[default]
    PeerIp,
    /// Client sends its name as the first line
    Handshake,
}

impl From<KeyModeSetting> for KeyMode {
    fn from(setting: KeyModeSetting) -> Self {
        match setting {
            KeyModeSetting::PeerIp => KeyMode::PeerIp,
            KeyModeSetting::Handshake => KeyMode::Handshake,
        }
    }
}

impl FromStr for KeyModeSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<KeyMode>()? {
            KeyMode::PeerIp => Ok(KeyModeSetting::PeerIp),
            KeyMode::Handshake => Ok(KeyModeSetting::Handshake),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable console output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Relay server configuration as read from file and environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// How clients are identified
    pub key_mode: KeyModeSetting,
    /// Longest accepted frame in bytes
    pub max_frame_length: usize,
    /// Concurrent connection limit
    pub max_connections: usize,
    /// Outbound queue capacity per connection, in frames
    pub outbound_queue: usize,
    /// Idle connection timeout in seconds (0 disables)
    pub idle_timeout_secs: u64,
    /// Wait for room in a recipient's queue, in milliseconds
    pub forward_timeout_ms: u64,
    /// Single socket write limit, in milliseconds
    pub write_timeout_ms: u64,
    /// Time allowed for the naming handshake, in seconds
    pub handshake_timeout_secs: u64,
    /// Flush allowance for a closing connection, in milliseconds
    pub flush_timeout_ms: u64,
    /// Drain allowance on shutdown, in seconds
    pub drain_timeout_secs: u64,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            listen_addr: relay.listen_addr,
            key_mode: KeyModeSetting::PeerIp,
            max_frame_length: relay.max_frame_length,
            max_connections: relay.max_connections,
            outbound_queue: relay.outbound_queue,
            idle_timeout_secs: 0,
            forward_timeout_ms: relay.forward_timeout.as_millis() as u64,
            write_timeout_ms: relay.write_timeout.as_millis() as u64,
            handshake_timeout_secs: relay.handshake_timeout.as_secs(),
            flush_timeout_ms: relay.flush_timeout.as_millis() as u64,
            drain_timeout_secs: 30,
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `HOTLINE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply `HOTLINE_*` overrides using `lookup` to read variables.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        override_from(&lookup, "HOTLINE_LISTEN_ADDR", &mut self.listen_addr)?;
        override_from(&lookup, "HOTLINE_KEY_MODE", &mut self.key_mode)?;
        override_from(&lookup, "HOTLINE_MAX_FRAME_LENGTH", &mut self.max_frame_length)?;
        override_from(&lookup, "HOTLINE_MAX_CONNECTIONS", &mut self.max_connections)?;
        override_from(&lookup, "HOTLINE_OUTBOUND_QUEUE", &mut self.outbound_queue)?;
        override_from(&lookup, "HOTLINE_IDLE_TIMEOUT_SECS", &mut self.idle_timeout_secs)?;
        override_from(&lookup, "HOTLINE_FORWARD_TIMEOUT_MS", &mut self.forward_timeout_ms)?;
        override_from(&lookup, "HOTLINE_WRITE_TIMEOUT_MS", &mut self.write_timeout_ms)?;
        override_from(
            &lookup,
            "HOTLINE_HANDSHAKE_TIMEOUT_SECS",
            &mut self.handshake_timeout_secs,
        )?;
        override_from(&lookup, "HOTLINE_FLUSH_TIMEOUT_MS", &mut self.flush_timeout_ms)?;
        override_from(&lookup, "HOTLINE_DRAIN_TIMEOUT_SECS", &mut self.drain_timeout_secs)?;
        override_from(&lookup, "HOTLINE_LOG_FORMAT", &mut self.log_format)?;
        Ok(())
    }

    /// Build the relay library's configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            listen_addr: self.listen_addr,
            key_mode: self.key_mode.into(),
            max_frame_length: self.max_frame_length,
            max_connections: self.max_connections,
            outbound_queue: self.outbound_queue,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            forward_timeout: Duration::from_millis(self.forward_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.listen_addr);
        info!("Key mode: {}", KeyMode::from(self.key_mode));
        info!(
            "Limits: {} connections, {} byte frames, {} queued frames per connection",
            self.max_connections, self.max_frame_length, self.outbound_queue
        );
        if self.idle_timeout_secs > 0 {
            info!("Idle timeout: {}s", self.idle_timeout_secs);
        } else {
            info!("Idle timeout: disabled");
        }
        info!("Drain timeout: {}s", self.drain_timeout_secs);
    }
}

fn override_from<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(var) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_match_relay_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:5001");
        assert_eq!(config.key_mode, KeyModeSetting::PeerIp);

        let relay = config.relay_config();
        assert_eq!(relay.max_frame_length, 4096);
        assert_eq!(relay.max_connections, 1024);
        assert_eq!(relay.outbound_queue, 64);
        assert!(relay.idle_timeout.is_none());
        assert_eq!(relay.forward_timeout, Duration::from_secs(2));
        assert_eq!(relay.write_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_timeout(), Duration::from_secs(30));
        assert!(relay.validate().is_ok());
    }

    #[test]
    fn test_load_without_path_uses_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen_addr = "127.0.0.1:7000"
key_mode = "handshake"
idle_timeout_secs = 300
log_format = "json"
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:7000");
        assert_eq!(config.key_mode, KeyModeSetting::Handshake);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.max_connections, 1024);

        let relay = config.relay_config();
        assert_eq!(relay.key_mode, KeyMode::Handshake);
        assert_eq!(relay.idle_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = ServerConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_connections = \"lots\"").unwrap();
        let err = ServerConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env_from(env(&[
                ("HOTLINE_LISTEN_ADDR", "127.0.0.1:6000"),
                ("HOTLINE_KEY_MODE", "handshake"),
                ("HOTLINE_MAX_CONNECTIONS", " 8 "),
                ("HOTLINE_FORWARD_TIMEOUT_MS", "250"),
                ("HOTLINE_LOG_FORMAT", "JSON"),
            ]))
            .unwrap();

        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:6000");
        assert_eq!(config.key_mode, KeyModeSetting::Handshake);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.relay_config().forward_timeout,
            Duration::from_millis(250)
        );
        // Untouched settings keep their values.
        assert_eq!(config.outbound_queue, 64);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_from(env(&[("HOTLINE_OUTBOUND_QUEUE", "many")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidEnv { var, value } => {
                assert_eq!(var, "HOTLINE_OUTBOUND_QUEUE");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_values_out_of_range_fail_validation() {
        let huge = usize::MAX.to_string();

        let mut config = ServerConfig::default();
        config
            .apply_env_from(env(&[("HOTLINE_MAX_CONNECTIONS", huge.as_str())]))
            .unwrap();
        assert!(hotline_relay::RelayServer::new(config.relay_config()).is_err());

        let mut config = ServerConfig::default();
        config
            .apply_env_from(env(&[("HOTLINE_OUTBOUND_QUEUE", huge.as_str())]))
            .unwrap();
        assert!(config.relay_config().validate().is_err());

        let mut config = ServerConfig::default();
        config
            .apply_env_from(env(&[("HOTLINE_WRITE_TIMEOUT_MS", "0")]))
            .unwrap();
        assert!(config.relay_config().validate().is_err());
    }

    #[test]
    fn test_key_mode_from_str() {
        assert_eq!(
            "peer_ip".parse::<KeyModeSetting>(),
            Ok(KeyModeSetting::PeerIp)
        );
        assert_eq!(
            "Handshake".parse::<KeyModeSetting>(),
            Ok(KeyModeSetting::Handshake)
        );
        assert!("carrier-pigeon".parse::<KeyModeSetting>().is_err());
    }
}
