//! Integration test: the executor against a real HTTP server (via
//! `wiremock`) standing in for the internal service a mapping points at.

use tokio::sync::mpsc;
use tunnel_protocol::frame::RequestPayload;
use tunnel_protocol::{Frame, PortMapping};
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "../src/executor.rs"]
mod executor;

use executor::Executor;

fn mapping_for(server: &MockServer, id: Uuid) -> PortMapping {
    let url = url::Url::parse(&server.uri()).unwrap();
    PortMapping {
        id,
        external_domain: "app.example.test".into(),
        internal_host: url.host_str().unwrap().to_string(),
        internal_port: url.port().unwrap(),
        internal_use_tls: false,
        allow_self_signed_certs: false,
        is_enabled: true,
    }
}

#[tokio::test]
async fn forwards_request_and_returns_upstream_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/widgets"))
        .and(header("x-request-marker", "present"))
        .respond_with(ResponseTemplate::new(200).set_body_string("widgets!"))
        .mount(&server)
        .await;

    let mapping_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let exec = Executor::new(tx, 64 * 1024);
    exec.apply_snapshot(&[mapping_for(&server, mapping_id)]);

    exec.handle_request(RequestPayload {
        request_id: Uuid::new_v4(),
        mapping_id,
        method: "GET".into(),
        path: "/widgets".into(),
        headers: vec![("x-request-marker".into(), "present".into())],
        body: None,
        has_more_body: false,
    })
    .await;

    match rx.recv().await {
        Some(Frame::Response(p)) => {
            assert_eq!(p.status, 200);
            assert_eq!(p.body.unwrap(), b"widgets!");
        }
        other => panic!("expected a Response frame, got {other:?}"),
    }
}

#[tokio::test]
async fn strips_hop_by_hop_headers_before_forwarding() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(|req: &wiremock::Request| {
            if req.headers.get("connection").is_some() {
                ResponseTemplate::new(400)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .mount(&server)
        .await;

    let mapping_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let exec = Executor::new(tx, 64 * 1024);
    exec.apply_snapshot(&[mapping_for(&server, mapping_id)]);

    exec.handle_request(RequestPayload {
        request_id: Uuid::new_v4(),
        mapping_id,
        method: "GET".into(),
        path: "/".into(),
        headers: vec![("connection".into(), "keep-alive".into())],
        body: None,
        has_more_body: false,
    })
    .await;

    match rx.recv().await {
        Some(Frame::Response(p)) => assert_eq!(p.status, 200),
        other => panic!("expected a Response frame, got {other:?}"),
    }
}
