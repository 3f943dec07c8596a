//! # Tunnel Agent
//!
//! Maintains the outbound WebSocket tunnel to the Gateway and executes
//! routed HTTP requests against internal services named by the local
//! mapping file.
//!
//! ## Modules
//!
//! - [`config`]   — CLI/env configuration
//! - [`error`]     — error taxonomy
//! - [`mapping`]   — the watched mapping-file store
//! - [`executor`]  — per-request dispatch to internal services
//! - [`session`]   — the connect/auth/sync/heartbeat state machine

mod config;
mod error;
mod executor;
mod mapping;
mod session;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::config::AgentConfig;
use crate::mapping::FileMappingStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "tunnel agent exited with an error");
        return Err(e);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = AgentConfig::parse();
    config.validate()?;

    let (store, mapping_rx) = FileMappingStore::open(config.mapping_file.clone())?;
    // Leaked for the process lifetime: the watcher must outlive every task
    // that reads from `mapping_rx`, which is the whole life of the agent.
    Box::leak(Box::new(store));

    info!(mapping_file = %config.mapping_file.display(), "watching mapping file");

    session::run(Arc::new(config), mapping_rx).await;
    Ok(())
}
