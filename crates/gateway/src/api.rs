//! # Status API
//!
//! A small read-only surface for dashboards/health checks: whether an
//! Agent is currently connected and the mapping set it last synced.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::connection::ConnectionState;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub agent_version: Option<String>,
    pub mapping_count: usize,
    pub config_hash: String,
    pub pending_requests: usize,
}

/// `GET /api/status` — current connection and mapping-sync state.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let connected_state = state.connections.subscribe().borrow().clone();
    let (connected, agent_version) = match connected_state {
        ConnectionState::Connected { agent_version } => (true, Some(agent_version)),
        ConnectionState::Disconnected => (false, None),
    };
    let snapshot = state.mappings.load();

    Json(StatusResponse {
        connected,
        agent_version,
        mapping_count: snapshot.mappings.len(),
        config_hash: snapshot.config_hash.clone(),
        pending_requests: state.pending.len(),
    })
}
