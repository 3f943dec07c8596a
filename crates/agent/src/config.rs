//! # Agent configuration
//!
//! CLI flags with environment-variable fallbacks, mirroring the Gateway's
//! configuration surface.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunnel-agent", about = "Tunnel agent")]
pub struct AgentConfig {
    /// WebSocket URL of the Gateway's tunnel endpoint, e.g. `wss://gw.example.test/tunnel`.
    #[arg(long, env = "TUNNEL_GATEWAY_URL")]
    pub gateway_url: String,

    /// Shared pre-shared key, matching the Gateway's `--api-key`.
    #[arg(long, env = "TUNNEL_API_KEY")]
    pub api_key: String,

    /// JSON file holding the current port-mapping set.
    #[arg(long, env = "TUNNEL_MAPPING_FILE")]
    pub mapping_file: PathBuf,

    /// How often to send a `Heartbeat` while connected.
    #[arg(long, env = "TUNNEL_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// How long the Gateway may go without sending any frame before the
    /// Agent considers the session dead and reconnects.
    #[arg(long, env = "TUNNEL_HEARTBEAT_TIMEOUT_SECS", default_value_t = 90)]
    pub heartbeat_timeout_secs: u64,

    /// Deadline for the initial WebSocket connect.
    #[arg(long, env = "TUNNEL_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Deadline for the Auth/ConfigSync handshake once connected.
    #[arg(long, env = "TUNNEL_HANDSHAKE_TIMEOUT_SECS", default_value_t = 15)]
    pub handshake_timeout_secs: u64,

    /// Inline-body threshold for responses sent back to the Gateway.
    #[arg(long, env = "TUNNEL_CHUNK_THRESHOLD_BYTES", default_value_t = 64 * 1024)]
    pub chunk_threshold_bytes: usize,

    /// This Agent's own version, reported in the `Auth` frame.
    #[arg(long, env = "TUNNEL_AGENT_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub agent_version: String,
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), crate::error::AgentError> {
        if self.api_key.len() < 32 {
            return Err(crate::error::AgentError::Config(
                "apiKey must be at least 32 bytes".into(),
            ));
        }
        if !self.gateway_url.starts_with("ws://") && !self.gateway_url.starts_with("wss://") {
            return Err(crate::error::AgentError::Config(
                "gatewayUrl must be a ws:// or wss:// URL".into(),
            ));
        }
        Ok(())
    }
}
