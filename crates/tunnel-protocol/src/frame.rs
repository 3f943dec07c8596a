//! # Wire frames
//!
//! Defines the closed tagged union of messages exchanged between the Agent
//! and the Gateway over the tunnel session. Each variant carries its own
//! payload struct so `bincode` encodes only the fields that variant needs;
//! the numeric tag is assigned and written explicitly by [`crate::codec`]
//! rather than left to enum declaration order, so the wire numbering stays
//! stable even if variants are reordered in source.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single `key: value` header pair, order-preserving and duplicate-safe.
pub type HeaderPairs = Vec<(String, String)>;

/// First frame after transport-up: the Agent proves it holds the shared key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub api_key: String,
    pub agent_version: String,
}

/// The Gateway's verdict on an [`AuthPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResultPayload {
    pub success: bool,
    pub error: Option<String>,
    pub gateway_version: String,
}

/// A snapshot of the enabled mappings, pushed by the Agent whenever the set
/// changes (including immediately after a successful auth).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSyncPayload {
    pub mappings: Vec<crate::mapping::PortMapping>,
    pub config_hash: String,
}

/// The Gateway's acknowledgment that it applied a [`ConfigSyncPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigAckPayload {
    pub success: bool,
    pub error: Option<String>,
    pub config_hash: String,
}

/// Liveness ping, sent by the Agent every 30s while connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: i64,
}

/// Liveness reply, echoing the peer's timestamp plus the replier's own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAckPayload {
    pub peer_ts: i64,
    pub server_ts: i64,
}

/// HTTP request head, Gateway to Agent. If the body fits in one chunk it is
/// inlined here with `has_more_body = false`; otherwise `body` carries the
/// first chunk and subsequent [`RequestBodyChunkPayload`] frames follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub request_id: Uuid,
    pub mapping_id: Uuid,
    pub method: String,
    pub path: String,
    pub headers: HeaderPairs,
    pub body: Option<Vec<u8>>,
    pub has_more_body: bool,
}

/// HTTP response head, Agent to Gateway. Same inlining rule as [`RequestPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub request_id: Uuid,
    pub status: u16,
    pub headers: HeaderPairs,
    pub body: Option<Vec<u8>>,
    pub has_more_body: bool,
}

/// A streamed body chunk, used for both request and response bodies. The
/// direction is implied by which [`Frame`] variant wraps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyChunkPayload {
    pub request_id: Uuid,
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// Polite session teardown, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub reason: String,
}

/// Out-of-band error, optionally scoped to a single in-flight request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub request_id: Option<Uuid>,
    pub error: String,
    pub code: u32,
}

/// The closed set of frame kinds. Wire tags are defined in [`crate::codec`]
/// and are part of the stable protocol, not an implementation detail of this
/// enum's declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Auth(AuthPayload),
    AuthResult(AuthResultPayload),
    ConfigSync(ConfigSyncPayload),
    ConfigAck(ConfigAckPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    RequestBodyChunk(BodyChunkPayload),
    ResponseBodyChunk(BodyChunkPayload),
    Disconnect(DisconnectPayload),
    Error(ErrorPayload),
}

impl Frame {
    /// The stable numeric tag for this frame's kind, per the protocol table.
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Auth(_) => crate::codec::TAG_AUTH,
            Frame::AuthResult(_) => crate::codec::TAG_AUTH_RESULT,
            Frame::ConfigSync(_) => crate::codec::TAG_CONFIG_SYNC,
            Frame::ConfigAck(_) => crate::codec::TAG_CONFIG_ACK,
            Frame::Heartbeat(_) => crate::codec::TAG_HEARTBEAT,
            Frame::HeartbeatAck(_) => crate::codec::TAG_HEARTBEAT_ACK,
            Frame::Request(_) => crate::codec::TAG_REQUEST,
            Frame::Response(_) => crate::codec::TAG_RESPONSE,
            Frame::RequestBodyChunk(_) => crate::codec::TAG_REQUEST_BODY_CHUNK,
            Frame::ResponseBodyChunk(_) => crate::codec::TAG_RESPONSE_BODY_CHUNK,
            Frame::Disconnect(_) => crate::codec::TAG_DISCONNECT,
            Frame::Error(_) => crate::codec::TAG_ERROR,
        }
    }

    /// The `requestId` this frame is scoped to, if any. Used by the pending
    /// request map on the Gateway side to route inbound frames.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Frame::Response(p) => Some(p.request_id),
            Frame::RequestBodyChunk(p) => Some(p.request_id),
            Frame::ResponseBodyChunk(p) => Some(p.request_id),
            Frame::Request(p) => Some(p.request_id),
            Frame::Error(p) => p.request_id,
            _ => None,
        }
    }
}
