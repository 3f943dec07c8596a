//! # Gateway configuration
//!
//! Read from CLI flags, falling back to environment variables of the same
//! name (via `clap`'s `env` feature), so the same binary can be driven by a
//! flag in dev and by env vars in a container.

use clap::Parser;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunnel-gateway", about = "Tunnel relay gateway")]
pub struct GatewayConfig {
    /// Shared pre-shared key the Agent must present. Minimum 32 bytes.
    #[arg(long, env = "TUNNEL_API_KEY")]
    pub api_key: String,

    /// Address the HTTP/WebSocket server binds to.
    #[arg(long, env = "TUNNEL_LISTEN_ADDR", default_value = "0.0.0.0:7070")]
    pub listen_addr: std::net::SocketAddr,

    /// Base URL of the edge proxy's admin API, e.g. `http://127.0.0.1:8001`.
    #[arg(long, env = "TUNNEL_EDGE_ADMIN_URL")]
    pub edge_admin_url: Option<String>,

    /// Total wall-clock deadline for a single routed request.
    #[arg(long, env = "TUNNEL_REQUEST_DEADLINE_SECS", default_value_t = 120)]
    pub request_deadline_secs: u64,

    /// Inactivity deadline between body chunks of a single routed request.
    #[arg(long, env = "TUNNEL_CHUNK_DEADLINE_SECS", default_value_t = 30)]
    pub chunk_deadline_secs: u64,

    /// Inline-body threshold; bodies at or under this size travel in the
    /// `Request`/`Response` head frame instead of as streamed chunks.
    #[arg(long, env = "TUNNEL_CHUNK_THRESHOLD_BYTES", default_value_t = 64 * 1024)]
    pub chunk_threshold_bytes: usize,

    /// How long the Agent may go without observed traffic before the
    /// Gateway considers the session dead.
    #[arg(long, env = "TUNNEL_HEARTBEAT_TIMEOUT_SECS", default_value_t = 90)]
    pub heartbeat_timeout_secs: u64,

    /// How often the reconciler probes the edge proxy for routes it owns,
    /// to detect an edge-proxy restart.
    #[arg(long, env = "TUNNEL_RECONCILE_PROBE_SECS", default_value_t = 30)]
    pub reconcile_probe_secs: u64,

    /// This Gateway's own version, reported in `AuthResult`.
    #[arg(long, env = "TUNNEL_GATEWAY_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub gateway_version: String,
}

impl GatewayConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn chunk_deadline(&self) -> Duration {
        Duration::from_secs(self.chunk_deadline_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reconcile_probe_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_probe_secs)
    }

    /// Validates the configuration invariants spelled out in the external
    /// interfaces section: the key must be at least 32 bytes.
    pub fn validate(&self) -> Result<(), crate::error::GatewayError> {
        if self.api_key.len() < 32 {
            return Err(crate::error::GatewayError::Config(
                "apiKey must be at least 32 bytes".into(),
            ));
        }
        Ok(())
    }
}
