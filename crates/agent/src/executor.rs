//! # Request executor
//!
//! Runs a `Request` frame against the internal service it targets and
//! streams the result back as `Response`/`ResponseBodyChunk` frames. Each
//! mapping gets its own `reqwest::Client` so `allowSelfSignedCerts` is a
//! per-target toggle rather than a process-global one.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;
use tunnel_protocol::frame::{BodyChunkPayload, RequestPayload, ResponsePayload};
use tunnel_protocol::{is_hop_by_hop, ConfigSnapshot, Frame, PortMapping};
use uuid::Uuid;

use arc_swap::ArcSwap;

struct PendingBody {
    head: RequestPayload,
    buffer: Vec<u8>,
}

pub struct Executor {
    out_tx: mpsc::UnboundedSender<Frame>,
    chunk_threshold: usize,
    snapshot: ArcSwap<ConfigSnapshot>,
    clients: DashMap<Uuid, reqwest::Client>,
    pending_bodies: DashMap<Uuid, PendingBody>,
}

impl Executor {
    pub fn new(out_tx: mpsc::UnboundedSender<Frame>, chunk_threshold: usize) -> Self {
        Self {
            out_tx,
            chunk_threshold,
            snapshot: ArcSwap::from_pointee(ConfigSnapshot {
                mappings: vec![],
                config_hash: tunnel_protocol::mapping::compute_config_hash(&[]),
            }),
            clients: DashMap::new(),
            pending_bodies: DashMap::new(),
        }
    }

    /// Rebuilds the mapping snapshot and the per-mapping client cache. Any
    /// mapping dropped from the set gets its cached client evicted too.
    pub fn apply_snapshot(&self, mappings: &[PortMapping]) {
        let snapshot = Arc::new(ConfigSnapshot::from_enabled(mappings));
        self.clients.retain(|id, _| snapshot.find(*id).is_some());
        for mapping in &snapshot.mappings {
            self.clients.entry(mapping.id).or_insert_with(|| {
                reqwest::Client::builder()
                    .danger_accept_invalid_certs(mapping.allow_self_signed_certs)
                    .build()
                    .unwrap_or_default()
            });
        }
        self.snapshot.store(snapshot);
    }

    pub async fn handle_request(&self, payload: RequestPayload) {
        if payload.has_more_body {
            self.pending_bodies.insert(
                payload.request_id,
                PendingBody {
                    buffer: payload.body.clone().unwrap_or_default(),
                    head: payload,
                },
            );
            return;
        }
        let body = payload.body.clone().unwrap_or_default();
        self.execute(payload, body).await;
    }

    pub async fn handle_request_body_chunk(&self, chunk: BodyChunkPayload) {
        let Some((_, mut pending)) = self.pending_bodies.remove(&chunk.request_id) else {
            warn!(request_id = %chunk.request_id, "body chunk for unknown or already-dispatched request");
            return;
        };
        pending.buffer.extend_from_slice(&chunk.data);
        if chunk.is_final {
            self.execute(pending.head, pending.buffer).await;
        } else {
            self.pending_bodies.insert(chunk.request_id, pending);
        }
    }

    async fn execute(&self, head: RequestPayload, body: Vec<u8>) {
        let request_id = head.request_id;
        let snapshot = self.snapshot.load();
        let Some(mapping) = snapshot.find(head.mapping_id) else {
            self.send_error(request_id, "mapping no longer active".into());
            return;
        };

        let client = match self.clients.get(&mapping.id) {
            Some(c) => c.clone(),
            None => reqwest::Client::new(),
        };

        let scheme = if mapping.internal_use_tls { "https" } else { "http" };
        let url = format!(
            "{scheme}://{}:{}{}",
            mapping.internal_host, mapping.internal_port, head.path
        );

        let method = match head.method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => {
                self.send_error(request_id, format!("unsupported method {}", head.method));
                return;
            }
        };

        let mut builder = client.request(method, &url);
        for (name, value) in &head.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                self.send_error(request_id, format!("upstream request failed: {e}"));
                return;
            }
        };

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut stream = response.bytes_stream();
        let mut first_chunk = Vec::new();
        let mut stream_ended = true;
        while let Some(next) = stream.next().await {
            match next {
                Ok(bytes) => {
                    first_chunk.extend_from_slice(&bytes);
                    if first_chunk.len() >= self.chunk_threshold {
                        stream_ended = false;
                        break;
                    }
                }
                Err(e) => {
                    self.send_error(request_id, format!("upstream body read failed: {e}"));
                    return;
                }
            }
        }

        let _ = self.out_tx.send(Frame::Response(ResponsePayload {
            request_id,
            status,
            headers,
            body: Some(first_chunk),
            has_more_body: !stream_ended,
        }));

        if stream_ended {
            return;
        }

        loop {
            match stream.next().await {
                Some(Ok(bytes)) => {
                    let is_final = false;
                    if self
                        .out_tx
                        .send(Frame::ResponseBodyChunk(BodyChunkPayload {
                            request_id,
                            data: bytes.to_vec(),
                            is_final,
                        }))
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, %request_id, "upstream body stream failed mid-response");
                    let _ = self.out_tx.send(Frame::ResponseBodyChunk(BodyChunkPayload {
                        request_id,
                        data: vec![],
                        is_final: true,
                    }));
                    return;
                }
                None => {
                    let _ = self.out_tx.send(Frame::ResponseBodyChunk(BodyChunkPayload {
                        request_id,
                        data: vec![],
                        is_final: true,
                    }));
                    return;
                }
            }
        }
    }

    fn send_error(&self, request_id: Uuid, message: String) {
        let _ = self.out_tx.send(Frame::Response(ResponsePayload {
            request_id,
            status: 502,
            headers: vec![],
            body: Some(vec![]),
            has_more_body: false,
        }));
        warn!(%request_id, error = %message, "request execution failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(id: Uuid) -> PortMapping {
        PortMapping {
            id,
            external_domain: "app.example.test".into(),
            internal_host: "10.0.0.5".into(),
            internal_port: 8080,
            internal_use_tls: false,
            allow_self_signed_certs: false,
            is_enabled: true,
        }
    }

    #[tokio::test]
    async fn request_with_unknown_mapping_yields_a_synthetic_502() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = Executor::new(tx, 64 * 1024);
        executor.apply_snapshot(&[mapping(Uuid::new_v4())]);

        executor
            .handle_request(RequestPayload {
                request_id: Uuid::new_v4(),
                mapping_id: Uuid::new_v4(),
                method: "GET".into(),
                path: "/".into(),
                headers: vec![],
                body: None,
                has_more_body: false,
            })
            .await;

        match rx.recv().await {
            Some(Frame::Response(p)) => assert_eq!(p.status, 502),
            other => panic!("expected a synthetic 502 response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunked_request_body_is_reassembled_before_dispatch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let executor = Executor::new(tx, 64 * 1024);
        let id = Uuid::new_v4();
        executor
            .handle_request(RequestPayload {
                request_id: id,
                mapping_id: Uuid::new_v4(),
                method: "POST".into(),
                path: "/".into(),
                headers: vec![],
                body: Some(b"hello, ".to_vec()),
                has_more_body: true,
            })
            .await;
        assert!(executor.pending_bodies.contains_key(&id));

        executor
            .handle_request_body_chunk(BodyChunkPayload {
                request_id: id,
                data: b"world".to_vec(),
                is_final: true,
            })
            .await;
        // The pending entry is dispatched (and removed) once the final chunk
        // arrives; the mapping doesn't exist so it fails fast with a 502
        // rather than hanging, which is enough to prove reassembly ran.
        assert!(!executor.pending_bodies.contains_key(&id));
    }
}
