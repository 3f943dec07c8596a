//! # Tunnel session
//!
//! Accepts the single WebSocket connection an Agent maintains, runs its
//! auth/sync/heartbeat/dispatch state machine, and tears it down cleanly.
//! Request/response frames themselves are only routed here — constructing
//! them from an inbound edge HTTP request is [`crate::router`]'s job.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::frame::{
    AuthResultPayload, ConfigAckPayload, DisconnectPayload, HeartbeatAckPayload,
};
use tunnel_protocol::{ConfigSnapshot, Frame};

use crate::connection::ActiveSession;
use crate::error::GatewayError;
use crate::pending::PendingEvent;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    key: Option<String>,
}

fn extract_presented_key(headers: &HeaderMap, query: &WsAuthQuery) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    query.key.clone()
}

fn keys_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// `GET /tunnel` — upgrades to the WebSocket the Agent holds open for the
/// lifetime of its connection. The API key is checked here, before the
/// upgrade completes, so an unauthenticated caller never gets a socket; the
/// protocol-level `Auth` frame exchanged just after upgrade re-checks the
/// same key, since a bearer key presented at the transport layer and one
/// presented in-band are two different trust boundaries worth defending
/// independently.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsAuthQuery>,
) -> impl IntoResponse {
    let presented = extract_presented_key(&headers, &query);
    let authorized = presented
        .as_deref()
        .map(|k| keys_match(k, &state.config.api_key))
        .unwrap_or(false);

    if !authorized {
        let err = GatewayError::AuthenticationRejected(
            "missing or invalid bearer key on the upgrade request".into(),
        );
        warn!(error = %err, "rejecting websocket upgrade");
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match tunnel_protocol::encode(&frame) {
                Ok(bytes) => {
                    if ws_sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode outbound frame"),
            }
        }
        let _ = ws_sink.close().await;
    });

    if let Err(e) = authenticate(&mut ws_stream, &tx, &state).await {
        warn!(error = %e, "agent session rejected during auth");
        drop(tx);
        let _ = outbound.await;
        return;
    }

    let now = state.clock.unix_millis();
    let candidate = ActiveSession::new(tx.clone(), state.config.gateway_version.clone(), now);
    let (outcome, replaced) = state.connections.try_register(candidate, now).await;

    match outcome {
        crate::connection::RegisterOutcome::Rejected => {
            let _ = tx.send(Frame::AuthResult(AuthResultPayload {
                success: false,
                error: Some("another agent is already connected".into()),
                gateway_version: state.config.gateway_version.clone(),
            }));
            drop(tx);
            let _ = outbound.await;
            return;
        }
        crate::connection::RegisterOutcome::Accepted => {
            let _ = tx.send(Frame::AuthResult(AuthResultPayload {
                success: true,
                error: None,
                gateway_version: state.config.gateway_version.clone(),
            }));
        }
    }

    if let Some(previous) = replaced {
        let _ = previous.send(Frame::Disconnect(DisconnectPayload {
            reason: "replaced by a newer agent connection".into(),
        }));
        state.pending.fail_all().await;
    }

    info!("agent session authenticated");

    // Any inbound frame counts as peer traffic (the Agent sends a Heartbeat
    // on a fixed cadence regardless of other activity, so this is
    // equivalent to watching heartbeats specifically) — if none arrives
    // within the timeout the session is presumed half-open and closed, even
    // though a plain TCP read would otherwise block forever.
    let heartbeat_timeout = state.config.heartbeat_timeout();
    loop {
        match tokio::time::timeout(heartbeat_timeout, ws_stream.next()).await {
            Ok(Some(Ok(msg))) => {
                let bytes = match msg {
                    Message::Binary(b) => b,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let frame = match tunnel_protocol::decode(&bytes) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed inbound frame");
                        continue;
                    }
                };
                if matches!(frame, Frame::Disconnect(_)) {
                    break;
                }
                if !dispatch(&frame, &state, &tx).await {
                    break;
                }
            }
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!(?heartbeat_timeout, "agent session heartbeat timeout; closing");
                break;
            }
        }
    }

    if state.connections.remove_if_current(&tx).await.is_some() {
        state.pending.fail_all().await;
    }
    drop(tx);
    let _ = outbound.await;
    info!("agent session ended");
}

/// Waits (with a timeout) for the first frame, which must be `Auth`, and
/// replies with the plain reject path if it isn't — this runs before the
/// session is registered as active, so a slow or malicious peer can't hold
/// the single-agent slot hostage.
async fn authenticate(
    ws_stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    tx: &mpsc::UnboundedSender<Frame>,
    state: &AppState,
) -> Result<(), GatewayError> {
    let first = tokio::time::timeout(Duration::from_secs(10), ws_stream.next()).await;
    let Ok(Some(Ok(Message::Binary(bytes)))) = first else {
        return Err(GatewayError::ProtocolViolation(
            "no Auth frame arrived within the handshake timeout".into(),
        ));
    };
    let Ok(Frame::Auth(auth)) = tunnel_protocol::decode(&bytes) else {
        let _ = tx.send(Frame::AuthResult(AuthResultPayload {
            success: false,
            error: Some("expected Auth as the first frame".into()),
            gateway_version: state.config.gateway_version.clone(),
        }));
        return Err(GatewayError::ProtocolViolation(
            "first frame was not a decodable Auth frame".into(),
        ));
    };
    if !keys_match(&auth.api_key, &state.config.api_key) {
        let _ = tx.send(Frame::AuthResult(AuthResultPayload {
            success: false,
            error: Some("invalid api key".into()),
            gateway_version: state.config.gateway_version.clone(),
        }));
        return Err(GatewayError::AuthenticationRejected(
            "api key presented in the Auth frame did not match".into(),
        ));
    }
    Ok(())
}

/// Handles one inbound frame once the session is authenticated. Returns
/// `false` if the session should be torn down.
async fn dispatch(frame: &Frame, state: &AppState, tx: &mpsc::UnboundedSender<Frame>) -> bool {
    match frame {
        Frame::ConfigSync(payload) => {
            let (valid_mappings, rejected) = tunnel_protocol::mapping::sanitize(&payload.mappings);
            for (mapping, e) in &rejected {
                warn!(
                    domain = %mapping.external_domain,
                    error = %e,
                    "dropping invalid mapping from ConfigSync; the rest of the set still applies"
                );
            }

            let snapshot = Arc::new(ConfigSnapshot::from_enabled(&valid_mappings));
            let local_hash = snapshot.config_hash.clone();
            state.mappings.store(snapshot.clone());

            let reconciler = state.reconciler.clone();
            let mappings = snapshot.mappings.clone();
            tokio::spawn(async move {
                if let Err(e) = reconciler.reconcile(&mappings).await {
                    let wrapped = GatewayError::Reconcile(e.to_string());
                    warn!(error = %wrapped, "edge reconcile failed; will retry on next sync");
                }
            });

            let _ = tx.send(Frame::ConfigAck(ConfigAckPayload {
                success: true,
                error: None,
                config_hash: local_hash,
            }));
            true
        }
        Frame::Heartbeat(payload) => {
            let now = state.clock.unix_millis();
            state.connections.touch_heartbeat(now).await;
            let _ = tx.send(Frame::HeartbeatAck(HeartbeatAckPayload {
                peer_ts: payload.timestamp,
                server_ts: now,
            }));
            true
        }
        Frame::Response(payload) => {
            state
                .pending
                .deliver(
                    payload.request_id,
                    PendingEvent::Head {
                        status: payload.status,
                        headers: payload.headers.clone(),
                        has_more_body: payload.has_more_body,
                    },
                )
                .await;
            if let Some(body) = &payload.body {
                state
                    .pending
                    .deliver(payload.request_id, PendingEvent::Chunk(body.clone()))
                    .await;
            }
            if !payload.has_more_body {
                state.pending.deliver(payload.request_id, PendingEvent::Final).await;
            }
            true
        }
        Frame::ResponseBodyChunk(payload) => {
            if !payload.data.is_empty() {
                state
                    .pending
                    .deliver(payload.request_id, PendingEvent::Chunk(payload.data.clone()))
                    .await;
            }
            if payload.is_final {
                state.pending.deliver(payload.request_id, PendingEvent::Final).await;
            }
            true
        }
        Frame::Error(payload) => {
            if let Some(request_id) = payload.request_id {
                state
                    .pending
                    .deliver(
                        request_id,
                        PendingEvent::Head {
                            status: 502,
                            headers: vec![],
                            has_more_body: false,
                        },
                    )
                    .await;
                state.pending.deliver(request_id, PendingEvent::Final).await;
            } else {
                warn!(error = %payload.error, code = payload.code, "agent reported a session-level error");
            }
            true
        }
        _ => true,
    }
}
