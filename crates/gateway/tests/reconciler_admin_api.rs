//! Integration test: the reconciler against a real HTTP server (via
//! `wiremock`) standing in for the edge proxy's admin API.

use tunnel_protocol::PortMapping;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "../src/reconciler.rs"]
mod reconciler;

use reconciler::{route_id_for, EdgeRoute, HttpEdgeAdminClient, Reconciler, ROUTE_ID_PREFIX};

fn mapping(domain: &str) -> PortMapping {
    PortMapping {
        id: Uuid::new_v4(),
        external_domain: domain.into(),
        internal_host: "10.0.0.5".into(),
        internal_port: 8080,
        internal_use_tls: false,
        allow_self_signed_certs: false,
        is_enabled: true,
    }
}

#[tokio::test]
async fn applies_new_routes_against_the_admin_api() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/routes"))
        .and(query_param("owner", ROUTE_ID_PREFIX))
        .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<EdgeRoute>::new()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = HttpEdgeAdminClient::new(server.uri());
    let reconciler = Reconciler::new(std::sync::Arc::new(client), "http://gateway:9000".into());

    let mappings = vec![mapping("a.example.test")];
    reconciler.reconcile(&mappings).await.unwrap();
}

#[tokio::test]
async fn deletes_routes_the_edge_proxy_still_owns_but_the_target_set_dropped() {
    let server = MockServer::start().await;
    let stale_id = route_id_for(Uuid::new_v4());

    let stale = EdgeRoute {
        route_id: stale_id.clone(),
        host: "gone.example.test".into(),
        upstream: "http://gateway:9000".into(),
    };

    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vec![stale]))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/routes/{stale_id}")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = HttpEdgeAdminClient::new(server.uri());
    let reconciler = Reconciler::new(std::sync::Arc::new(client), "http://gateway:9000".into());

    // Empty target set: the only owned route should be deleted.
    reconciler.reconcile(&[]).await.unwrap();
}
