//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{KeyModeSetting, LogFormat, ServerConfig};

/// Hotline - point-to-point text message relay
#[derive(Debug, Parser)]
#[command(name = "hotline-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "HOTLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g. 0.0.0.0:5001)
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// How clients are identified
    #[arg(long, value_enum)]
    pub key_mode: Option<KeyModeSetting>,

    /// Concurrent connection limit
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Longest accepted frame in bytes
    #[arg(long)]
    pub max_frame_length: Option<usize>,

    /// Idle connection timeout in seconds (0 disables)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

impl Cli {
    /// Apply flags given on the command line on top of `config`.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(key_mode) = self.key_mode {
            config.key_mode = key_mode;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(max_frame_length) = self.max_frame_length {
            config.max_frame_length = max_frame_length;
        }
        if let Some(idle_timeout_secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = idle_timeout_secs;
        }
        if let Some(log_format) = self.log_format {
            config.log_format = log_format;
        }
    }
}
