//! # Edge reconciler
//!
//! Makes the edge proxy's HTTP route table equal to the enabled-mapping
//! set. Purely declarative: given a target set, diff it against what the
//! edge proxy currently reports owning, and apply only the difference.
//!
//! [`EdgeAdminClient`] is a trait so this diff logic can be unit-tested
//! without a live edge proxy; [`HttpEdgeAdminClient`] is the shipped
//! implementation speaking JSON over `reqwest`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tunnel_protocol::PortMapping;
use uuid::Uuid;

/// A single route this reconciler owns on the edge proxy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EdgeRoute {
    pub route_id: String,
    pub host: String,
    pub upstream: String,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("edge admin API error: {0}")]
    Admin(String),
}

#[async_trait]
pub trait EdgeAdminClient: Send + Sync {
    /// Lists the routes currently live on the edge proxy that are owned by
    /// this reconciler (identified by the `tunnel-` route-id prefix).
    async fn list_owned_routes(&self) -> Result<Vec<EdgeRoute>, ReconcileError>;

    /// Creates or updates a route.
    async fn apply_route(&self, route: &EdgeRoute) -> Result<(), ReconcileError>;

    /// Deletes a route by id.
    async fn delete_route(&self, route_id: &str) -> Result<(), ReconcileError>;
}

/// Speaks a small JSON REST contract to the edge proxy's admin API:
/// `POST {base}/routes` to upsert, `GET {base}/routes?owner=tunnel-` to
/// list, `DELETE {base}/routes/{id}` to remove. The exact shape is dictated
/// by the edge proxy in a real deployment; this is the generic contract the
/// core owns: given a target set, produce the admin-API calls.
pub struct HttpEdgeAdminClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEdgeAdminClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EdgeAdminClient for HttpEdgeAdminClient {
    async fn list_owned_routes(&self) -> Result<Vec<EdgeRoute>, ReconcileError> {
        let url = format!("{}/routes?owner={}", self.base_url, ROUTE_ID_PREFIX);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ReconcileError::Admin(e.to_string()))?;
        resp.json::<Vec<EdgeRoute>>()
            .await
            .map_err(|e| ReconcileError::Admin(e.to_string()))
    }

    async fn apply_route(&self, route: &EdgeRoute) -> Result<(), ReconcileError> {
        let url = format!("{}/routes", self.base_url);
        self.client
            .post(&url)
            .json(route)
            .send()
            .await
            .map_err(|e| ReconcileError::Admin(e.to_string()))?
            .error_for_status()
            .map_err(|e| ReconcileError::Admin(e.to_string()))?;
        Ok(())
    }

    async fn delete_route(&self, route_id: &str) -> Result<(), ReconcileError> {
        let url = format!("{}/routes/{}", self.base_url, route_id);
        self.client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ReconcileError::Admin(e.to_string()))?
            .error_for_status()
            .map_err(|e| ReconcileError::Admin(e.to_string()))?;
        Ok(())
    }
}

/// A no-op client used when no edge admin URL is configured — reconciling
/// then simply never touches anything (useful for dev/test deployments
/// that route to the Gateway directly).
pub struct NullEdgeAdminClient;

#[async_trait]
impl EdgeAdminClient for NullEdgeAdminClient {
    async fn list_owned_routes(&self) -> Result<Vec<EdgeRoute>, ReconcileError> {
        Ok(vec![])
    }
    async fn apply_route(&self, _route: &EdgeRoute) -> Result<(), ReconcileError> {
        Ok(())
    }
    async fn delete_route(&self, _route_id: &str) -> Result<(), ReconcileError> {
        Ok(())
    }
}

pub const ROUTE_ID_PREFIX: &str = "tunnel-";

pub fn route_id_for(mapping_id: Uuid) -> String {
    format!("{ROUTE_ID_PREFIX}{mapping_id}")
}

pub struct Reconciler {
    client: Arc<dyn EdgeAdminClient>,
    gateway_upstream: String,
}

impl Reconciler {
    pub fn new(client: Arc<dyn EdgeAdminClient>, gateway_upstream: String) -> Self {
        Self {
            client,
            gateway_upstream,
        }
    }

    pub fn target_routes(&self, mappings: &[PortMapping]) -> Vec<EdgeRoute> {
        mappings
            .iter()
            .map(|m| EdgeRoute {
                route_id: route_id_for(m.id),
                host: m.external_domain.clone(),
                upstream: self.gateway_upstream.clone(),
            })
            .collect()
    }

    /// Diffs `mappings` against the edge proxy's currently-owned routes and
    /// applies add/update/remove. Individual route failures are logged and
    /// left for the next trigger — the caller still acks the sync (the
    /// invariant is *eventually* consistent).
    pub async fn reconcile(&self, mappings: &[PortMapping]) -> Result<(), ReconcileError> {
        let target = self.target_routes(mappings);
        let current = self.client.list_owned_routes().await?;

        let target_ids: HashSet<&str> = target.iter().map(|r| r.route_id.as_str()).collect();
        let current_by_id: HashMap<&str, &EdgeRoute> =
            current.iter().map(|r| (r.route_id.as_str(), r)).collect();

        for route in &target {
            let needs_apply = current_by_id
                .get(route.route_id.as_str())
                .map(|existing| *existing != route)
                .unwrap_or(true);
            if needs_apply {
                if let Err(e) = self.client.apply_route(route).await {
                    tracing::warn!(
                        route_id = %route.route_id,
                        error = %e,
                        "failed to apply edge route; will retry on next reconcile trigger"
                    );
                }
            }
        }

        for existing in &current {
            if !target_ids.contains(existing.route_id.as_str()) {
                if let Err(e) = self.client.delete_route(&existing.route_id).await {
                    tracing::warn!(
                        route_id = %existing.route_id,
                        error = %e,
                        "failed to delete stale edge route; will retry on next reconcile trigger"
                    );
                }
            }
        }

        Ok(())
    }
}
