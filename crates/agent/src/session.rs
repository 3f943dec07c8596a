//! # Tunnel session loop
//!
//! Owns the Agent's side of the connection lifecycle: connect, `Auth`,
//! initial `ConfigSync`, then a steady state of heartbeats, inbound request
//! dispatch, and mapping-file-triggered re-syncs. Reconnects with
//! exponential backoff on any failure (see `tunnel_protocol::backoff`).

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use tunnel_protocol::backoff::Backoff;
use tunnel_protocol::clock::{Clock, SystemClock};
use tunnel_protocol::frame::{AuthPayload, ConfigSyncPayload, HeartbeatPayload};
use tunnel_protocol::{ConfigSnapshot, Frame, PortMapping};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::executor::Executor;

/// Runs the reconnect loop forever: connect, run the session to
/// completion (which only happens on error or a server-initiated
/// disconnect), back off, and try again.
pub async fn run(config: Arc<AgentConfig>, mapping_rx: watch::Receiver<Vec<PortMapping>>) {
    let mut backoff = Backoff::default_schedule();
    loop {
        info!(gateway_url = %config.gateway_url, "connecting to gateway");
        match run_once(&config, mapping_rx.clone()).await {
            Ok(()) => {
                info!("tunnel session ended cleanly");
                backoff.reset();
            }
            Err(e) => {
                warn!(error = %e, "tunnel session failed");
            }
        }
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn run_once(
    config: &AgentConfig,
    mut mapping_rx: watch::Receiver<Vec<PortMapping>>,
) -> Result<(), AgentError> {
    let (ws_stream, _response) = tokio::time::timeout(
        config.connect_timeout(),
        tokio_tungstenite::connect_async(config.gateway_url.clone()),
    )
    .await
    .map_err(|_| AgentError::Transport("connect timed out".into()))?
    .map_err(|e| AgentError::Transport(e.to_string()))?;

    let (mut sink, mut stream) = ws_stream.split();

    send(&mut sink, &Frame::Auth(AuthPayload {
        api_key: config.api_key.clone(),
        agent_version: config.agent_version.clone(),
    }))
    .await?;

    match recv(&mut stream, config.handshake_timeout()).await? {
        Frame::AuthResult(p) if p.success => {
            info!(gateway_version = %p.gateway_version, "authenticated");
        }
        Frame::AuthResult(p) => {
            return Err(AgentError::Protocol(format!(
                "auth rejected: {}",
                p.error.unwrap_or_default()
            )));
        }
        other => {
            return Err(AgentError::Protocol(format!(
                "expected AuthResult, got {other:?}"
            )));
        }
    }

    let initial_mappings = mapping_rx.borrow().clone();
    let initial_snapshot = ConfigSnapshot::from_enabled(&initial_mappings);
    send(&mut sink, &Frame::ConfigSync(ConfigSyncPayload {
        mappings: initial_mappings.clone(),
        config_hash: initial_snapshot.config_hash.clone(),
    }))
    .await?;

    match recv(&mut stream, config.handshake_timeout()).await? {
        Frame::ConfigAck(p) if p.success => {}
        Frame::ConfigAck(p) => {
            return Err(AgentError::Protocol(format!(
                "config sync rejected: {}",
                p.error.unwrap_or_default()
            )));
        }
        other => {
            return Err(AgentError::Protocol(format!(
                "expected ConfigAck, got {other:?}"
            )));
        }
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let executor = Arc::new(Executor::new(out_tx.clone(), config.chunk_threshold_bytes));
    executor.apply_snapshot(&initial_mappings);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if send(&mut sink, &frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut last_hash = initial_snapshot.config_hash;
    let mut ticker = tokio::time::interval(config.heartbeat_interval());
    ticker.tick().await; // first tick fires immediately; consume it

    let heartbeat_timeout = config.heartbeat_timeout();
    let mut last_peer_traffic = std::time::Instant::now();
    let mut idle_check = tokio::time::interval(Duration::from_secs(1).min(heartbeat_timeout));

    let result = loop {
        tokio::select! {
            _ = idle_check.tick() => {
                if last_peer_traffic.elapsed() > heartbeat_timeout {
                    warn!(?heartbeat_timeout, "gateway went silent; closing session");
                    break Err(AgentError::Transport("heartbeat timeout".into()));
                }
            }
            _ = ticker.tick() => {
                let ts = SystemClock.unix_millis();
                if out_tx.send(Frame::Heartbeat(HeartbeatPayload { timestamp: ts })).is_err() {
                    break Ok(());
                }
            }
            changed = mapping_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let mappings = mapping_rx.borrow().clone();
                let snapshot = ConfigSnapshot::from_enabled(&mappings);
                if snapshot.config_hash != last_hash {
                    last_hash = snapshot.config_hash.clone();
                    executor.apply_snapshot(&mappings);
                    let _ = out_tx.send(Frame::ConfigSync(ConfigSyncPayload {
                        mappings,
                        config_hash: snapshot.config_hash,
                    }));
                }
            }
            msg = stream.next() => {
                last_peer_traffic = std::time::Instant::now();
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        match tunnel_protocol::decode(&bytes) {
                            Ok(frame) => {
                                if !dispatch(frame, &executor).await {
                                    break Ok(());
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed inbound frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(AgentError::Transport(e.to_string())),
                }
            }
        }
    };

    drop(out_tx);
    let _ = writer.await;
    result
}

/// Handles one inbound frame. Returns `false` if the session should end.
async fn dispatch(frame: Frame, executor: &Arc<Executor>) -> bool {
    match frame {
        Frame::Request(payload) => {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor.handle_request(payload).await;
            });
            true
        }
        Frame::RequestBodyChunk(chunk) => {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor.handle_request_body_chunk(chunk).await;
            });
            true
        }
        Frame::HeartbeatAck(_) | Frame::ConfigAck(_) => true,
        Frame::Disconnect(p) => {
            info!(reason = %p.reason, "gateway requested disconnect");
            false
        }
        Frame::Error(p) => {
            warn!(error = %p.error, code = p.code, "gateway reported an error");
            true
        }
        _ => true,
    }
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsStream =
    futures::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>;

async fn send(sink: &mut WsSink, frame: &Frame) -> Result<(), AgentError> {
    let bytes = tunnel_protocol::encode(frame).map_err(|e| AgentError::Protocol(e.to_string()))?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))
}

async fn recv(stream: &mut WsStream, timeout_dur: Duration) -> Result<Frame, AgentError> {
    let msg = tokio::time::timeout(timeout_dur, stream.next())
        .await
        .map_err(|_| AgentError::Protocol("handshake timed out".into()))?
        .ok_or_else(|| AgentError::Transport("connection closed during handshake".into()))?
        .map_err(|e| AgentError::Transport(e.to_string()))?;
    match msg {
        Message::Binary(bytes) => {
            tunnel_protocol::decode(&bytes).map_err(|e| AgentError::Protocol(e.to_string()))
        }
        other => Err(AgentError::Protocol(format!(
            "expected a binary frame during handshake, got {other:?}"
        ))),
    }
}
