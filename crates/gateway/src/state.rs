//! # Gateway application state
//!
//! Holds everything request handlers and the tunnel session need, cloned
//! (cheaply — everything inside is `Arc`) into each Axum handler.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tunnel_protocol::clock::{Clock, SystemClock};
use tunnel_protocol::ConfigSnapshot;

use crate::config::GatewayConfig;
use crate::connection::ConnectionManager;
use crate::pending::PendingRegistry;
use crate::reconciler::Reconciler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub connections: Arc<ConnectionManager>,
    pub pending: PendingRegistry,
    /// The mapping snapshot last acknowledged via `ConfigSync`/`ConfigAck`.
    /// Readers (the router) never hold a lock across I/O — they load a
    /// cheap `Arc` clone of the current snapshot and use it for the
    /// lifetime of one request.
    pub mappings: Arc<ArcSwap<ConfigSnapshot>>,
    pub reconciler: Arc<Reconciler>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: GatewayConfig, reconciler: Reconciler) -> Self {
        let connections = ConnectionManager::new(config.heartbeat_timeout());
        Self {
            config: Arc::new(config),
            connections: Arc::new(connections),
            pending: PendingRegistry::new(),
            mappings: Arc::new(ArcSwap::from_pointee(ConfigSnapshot {
                mappings: vec![],
                config_hash: tunnel_protocol::mapping::compute_config_hash(&[]),
            })),
            reconciler: Arc::new(reconciler),
            clock: Arc::new(SystemClock),
        }
    }
}
