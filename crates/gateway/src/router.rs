//! # Edge router
//!
//! The Axum fallback handler for all inbound edge HTTP traffic. Resolves
//! the `Host` header against the current mapping snapshot, turns the
//! request into `Request`/`RequestBodyChunk` frames sent down to the Agent,
//! and turns the Agent's `Response`/`ResponseBodyChunk` frames back into a
//! streamed HTTP response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, BodyDataStream};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;
use tunnel_protocol::frame::{BodyChunkPayload, RequestPayload};
use tunnel_protocol::{is_hop_by_hop, Frame};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::pending::{PendingEvent, PendingRequest};
use crate::state::AppState;

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn host_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string())
}

pub async fn edge_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let Some(host) = host_from(&parts.headers) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let snapshot = state.mappings.load();
    let Some(mapping) = snapshot.find_by_domain(&host) else {
        return (StatusCode::NOT_FOUND, "no mapping for this host").into_response();
    };

    if !state.connections.has_active_connection().await {
        return (StatusCode::BAD_GATEWAY, "no agent currently connected").into_response();
    }

    let request_id = Uuid::new_v4();
    let threshold = state.config.chunk_threshold_bytes;

    // Bodies at or under the inline threshold travel with the `Request`
    // head frame. Larger ones go out as an empty head with
    // `has_more_body = true`, immediately followed by `RequestBodyChunk`
    // frames read straight off the incoming stream — never buffering more
    // than `threshold` bytes at a time, so an upload of any size costs
    // O(threshold) memory rather than O(body).
    let mut data_stream = body.into_data_stream();
    let mut buffered = Vec::new();
    let mut overflow_chunk: Option<Bytes> = None;
    let mut read_failed = false;

    while buffered.len() <= threshold {
        match data_stream.next().await {
            Some(Ok(chunk)) => {
                if buffered.len() + chunk.len() > threshold {
                    overflow_chunk = Some(chunk);
                    break;
                }
                buffered.extend_from_slice(&chunk);
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed reading request body");
                read_failed = true;
                break;
            }
            None => break,
        }
    }

    if read_failed {
        return (StatusCode::BAD_REQUEST, "failed reading request body").into_response();
    }

    let has_more_body = overflow_chunk.is_some();
    let inline_body = Bytes::from(buffered);

    let head = Frame::Request(RequestPayload {
        request_id,
        mapping_id: mapping.id,
        method: parts.method.to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: header_pairs(&parts.headers),
        body: if has_more_body || inline_body.is_empty() {
            None
        } else {
            Some(inline_body.to_vec())
        },
        has_more_body,
    });

    let (events_tx, mut events_rx) = mpsc::channel::<PendingEvent>(32);
    let head_delivered = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let deadline = Instant::now() + state.config.request_deadline();

    state.pending.insert(
        request_id,
        PendingRequest {
            mapping_id: mapping.id,
            tx: events_tx,
            deadline,
            head_delivered: head_delivered.clone(),
        },
    );

    if let Err(e) = state.connections.send_frame(head).await {
        state.pending.remove(&request_id);
        warn!(error = %e, "failed to forward request to agent");
        return (StatusCode::BAD_GATEWAY, "agent connection unavailable").into_response();
    }

    if has_more_body {
        let mut prefix = Vec::with_capacity(2);
        if !inline_body.is_empty() {
            prefix.push(inline_body.clone());
        }
        if let Some(chunk) = overflow_chunk {
            prefix.push(chunk);
        }
        tokio::spawn(stream_request_body(
            state.connections.clone(),
            request_id,
            prefix,
            data_stream,
            threshold,
        ));
    }

    let request_deadline = state.config.request_deadline();
    let head_event = match timeout(request_deadline, events_rx.recv()).await {
        Ok(Some(PendingEvent::Head { status, headers, has_more_body })) => {
            head_delivered.store(true, std::sync::atomic::Ordering::SeqCst);
            Some((status, headers, has_more_body))
        }
        Ok(Some(_)) | Ok(None) => None,
        Err(_) => {
            state.pending.remove(&request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "agent did not respond in time").into_response();
        }
    };

    let Some((status, headers, _has_more_body)) = head_event else {
        state.pending.remove(&request_id);
        return (StatusCode::BAD_GATEWAY, "agent closed the request without responding")
            .into_response();
    };

    let mut response_headers = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response_headers.insert(name, value);
        }
    }

    let chunk_deadline = state.config.chunk_deadline();
    let pending = state.pending.clone();
    let body_stream = stream::unfold(
        (events_rx, request_id, pending, chunk_deadline),
        |(mut rx, request_id, pending, chunk_deadline)| async move {
            match timeout(chunk_deadline, rx.recv()).await {
                Ok(Some(PendingEvent::Chunk(data))) => {
                    Some((Ok::<_, std::io::Error>(Bytes::from(data)), (rx, request_id, pending, chunk_deadline)))
                }
                Ok(Some(PendingEvent::Final)) | Ok(None) => {
                    pending.remove(&request_id);
                    None
                }
                Ok(Some(PendingEvent::Head { .. })) => {
                    // A second head would be a protocol violation; treat the
                    // stream as complete rather than panic.
                    pending.remove(&request_id);
                    None
                }
                Err(_) => {
                    pending.remove(&request_id);
                    Some((
                        Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "agent went quiet mid-response",
                        )),
                        (rx, request_id, pending, chunk_deadline),
                    ))
                }
            }
        },
    );

    let mut builder = Response::builder().status(
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    *builder.headers_mut().unwrap() = response_headers;
    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
        })
}

/// Drains the rest of a request body straight onto the wire as
/// `RequestBodyChunk` frames, once the head frame has already announced
/// `has_more_body = true`. `prefix` carries the bytes already pulled off
/// `data_stream` while deciding the body didn't fit inline; everything after
/// that is read and forwarded one chunk at a time so the whole body is
/// never held in memory at once.
async fn stream_request_body(
    connections: Arc<ConnectionManager>,
    request_id: Uuid,
    prefix: Vec<Bytes>,
    mut data_stream: BodyDataStream,
    chunk_size: usize,
) {
    for chunk in prefix {
        if send_body_chunk(&connections, request_id, &chunk, false)
            .await
            .is_err()
        {
            return;
        }
    }

    loop {
        match data_stream.next().await {
            Some(Ok(chunk)) => {
                let mut offset = 0;
                while offset < chunk.len() {
                    let end = (offset + chunk_size).min(chunk.len());
                    if send_body_chunk(&connections, request_id, &chunk[offset..end], false)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    offset = end;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "request body stream failed mid-transfer");
                break;
            }
            None => break,
        }
    }

    let _ = send_body_chunk(&connections, request_id, &[], true).await;
}

async fn send_body_chunk(
    connections: &ConnectionManager,
    request_id: Uuid,
    data: &[u8],
    is_final: bool,
) -> Result<(), crate::connection::GatewayForwardError> {
    connections
        .send_frame(Frame::RequestBodyChunk(BodyChunkPayload {
            request_id,
            data: data.to_vec(),
            is_final,
        }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registered_manager() -> (Arc<ConnectionManager>, mpsc::UnboundedReceiver<Frame>) {
        let mgr = Arc::new(ConnectionManager::new(Duration::from_secs(90)));
        let (tx, rx) = mpsc::unbounded_channel();
        let session = crate::connection::ActiveSession::new(tx, "1.0.0".into(), 0);
        mgr.try_register(session, 0).await;
        (mgr, rx)
    }

    fn expect_chunk(frame: Frame) -> BodyChunkPayload {
        match frame {
            Frame::RequestBodyChunk(p) => p,
            other => panic!("expected RequestBodyChunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_request_body_forwards_prefix_then_drains_the_stream() {
        let (mgr, mut rx) = registered_manager().await;
        let request_id = Uuid::new_v4();
        let prefix = vec![Bytes::from_static(b"0123456789")];
        let body = Body::from(Bytes::from_static(b"rest-of-the-body"));
        let data_stream = body.into_data_stream();

        stream_request_body(mgr, request_id, prefix, data_stream, 5).await;

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.push(expect_chunk(frame));
        }

        assert_eq!(received[0].data, b"0123456789");
        assert!(!received[0].is_final);
        assert!(received.iter().any(|c| c.data == b"rest-"));
        assert!(received.last().unwrap().is_final);
        assert!(received.last().unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn stream_request_body_with_empty_prefix_still_sends_a_final_marker() {
        let (mgr, mut rx) = registered_manager().await;
        let request_id = Uuid::new_v4();
        let body = Body::from(Bytes::new());
        let data_stream = body.into_data_stream();

        stream_request_body(mgr, request_id, vec![], data_stream, 10).await;

        let frame = rx.try_recv().expect("final chunk should have been sent");
        let payload = expect_chunk(frame);
        assert!(payload.is_final);
        assert!(payload.data.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TE"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
