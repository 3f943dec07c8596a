//! # Tunnel Gateway
//!
//! The public-facing half of the tunnel: accepts the single Agent
//! WebSocket connection, routes edge HTTP traffic onto it, and keeps the
//! edge proxy's route table in sync with the Agent's mapping set.
//!
//! ## Architecture
//!
//! ```text
//! Edge proxy ──HTTP──► Gateway ──WS (tunnel-protocol)──► Agent ──HTTP──► internal service
//! ```
//!
//! ## Modules
//!
//! - [`config`]     — CLI/env configuration
//! - [`error`]       — error taxonomy
//! - [`connection`]  — single-active-agent session slot
//! - [`pending`]     — in-flight request registry
//! - [`reconciler`]  — edge proxy route-table sync
//! - [`session`]     — the Agent's WebSocket state machine
//! - [`router`]      — edge HTTP request routing
//! - [`api`]         — status endpoint
//! - [`state`]       — shared application state

mod api;
mod config;
mod connection;
mod error;
mod pending;
mod reconciler;
mod router;
mod session;
mod state;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::reconciler::{HttpEdgeAdminClient, NullEdgeAdminClient, Reconciler};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Ignored if absent: a `.env` file is a dev/container convenience, not
    // a requirement — real deployments set the vars directly.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_gateway=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "tunnel gateway exited with an error");
        return Err(e);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = GatewayConfig::parse();
    config.validate()?;

    let gateway_upstream = format!("http://{}", config.listen_addr);
    let reconciler = match &config.edge_admin_url {
        Some(url) => Reconciler::new(Arc::new(HttpEdgeAdminClient::new(url.clone())), gateway_upstream),
        None => {
            warn!("no --edge-admin-url configured; the edge route table will not be reconciled");
            Reconciler::new(Arc::new(NullEdgeAdminClient), gateway_upstream)
        }
    };

    let listen_addr = config.listen_addr;
    let state = AppState::new(config, reconciler);

    spawn_reconcile_probe(state.clone());

    let app = Router::new()
        .route("/tunnel", get(session::ws_handler))
        .route("/api/status", get(api::status))
        .fallback(router::edge_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(%listen_addr, "tunnel gateway listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically re-reconciles the last-known-good mapping snapshot against
/// the edge proxy, so a restarted edge proxy (which forgets our routes)
/// gets them back without waiting for the Agent to push a new `ConfigSync`.
fn spawn_reconcile_probe(state: AppState) {
    let interval = state.config.reconcile_probe_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot = state.mappings.load();
            if snapshot.mappings.is_empty() {
                continue;
            }
            if let Err(e) = state.reconciler.reconcile(&snapshot.mappings).await {
                let wrapped = GatewayError::Reconcile(e.to_string());
                warn!(error = %wrapped, "periodic edge reconcile probe failed");
            }
        }
    });
}
