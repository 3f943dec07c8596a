//! # Frame codec
//!
//! `encode`/`decode` turn a [`Frame`] into a single compressed binary
//! message and back. The wire layout is:
//!
//! ```text
//! lz4_flex(size-prepended) [ tag: u8 | bincode(payload) ]
//! ```
//!
//! `lz4_flex`'s size-prepended block format stores the uncompressed length
//! as a 4-byte little-endian prefix, which lets [`decode`] reject an
//! oversized frame before allocating the decompression buffer.

use crate::frame::*;
use thiserror::Error;

pub const TAG_AUTH: u8 = 1;
pub const TAG_AUTH_RESULT: u8 = 2;
pub const TAG_CONFIG_SYNC: u8 = 3;
pub const TAG_CONFIG_ACK: u8 = 4;
pub const TAG_HEARTBEAT: u8 = 5;
pub const TAG_HEARTBEAT_ACK: u8 = 6;
pub const TAG_REQUEST: u8 = 7;
pub const TAG_RESPONSE: u8 = 8;
pub const TAG_REQUEST_BODY_CHUNK: u8 = 9;
pub const TAG_RESPONSE_BODY_CHUNK: u8 = 10;
pub const TAG_DISCONNECT: u8 = 11;
pub const TAG_ERROR: u8 = 255;

/// Default cap on a single decoded frame's uncompressed size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown frame tag: {0}")]
    UnknownTag(u8),

    #[error("payload too large: {size} bytes exceeds cap of {cap} bytes")]
    PayloadTooLarge { size: usize, cap: usize },
}

/// Encodes `frame` using the default size cap ([`DEFAULT_MAX_FRAME_SIZE`]).
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    encode_with_cap(frame, DEFAULT_MAX_FRAME_SIZE)
}

/// Encodes `frame`, rejecting it if the uncompressed `[tag, payload]` buffer
/// exceeds `cap` bytes.
pub fn encode_with_cap(frame: &Frame, cap: usize) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(frame)?;
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(frame.tag());
    buf.extend_from_slice(&payload);

    if buf.len() > cap {
        return Err(CodecError::PayloadTooLarge {
            size: buf.len(),
            cap,
        });
    }

    Ok(lz4_flex::block::compress_prepend_size(&buf))
}

/// Decodes a frame previously produced by [`encode`], using the default
/// size cap.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    decode_with_cap(bytes, DEFAULT_MAX_FRAME_SIZE)
}

/// Decodes a frame, rejecting it before decompression if the prefixed
/// uncompressed size exceeds `cap` bytes.
pub fn decode_with_cap(bytes: &[u8], cap: usize) -> Result<Frame, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::MalformedFrame(
            "buffer shorter than the size prefix".into(),
        ));
    }

    let uncompressed_size =
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if uncompressed_size > cap {
        return Err(CodecError::PayloadTooLarge {
            size: uncompressed_size,
            cap,
        });
    }

    let buf = lz4_flex::block::decompress_size_prepended(bytes)
        .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

    let (&tag, payload) = buf
        .split_first()
        .ok_or_else(|| CodecError::MalformedFrame("empty frame".into()))?;

    decode_payload(tag, payload)
}

fn encode_payload(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let result = match frame {
        Frame::Auth(p) => bincode::serialize(p),
        Frame::AuthResult(p) => bincode::serialize(p),
        Frame::ConfigSync(p) => bincode::serialize(p),
        Frame::ConfigAck(p) => bincode::serialize(p),
        Frame::Heartbeat(p) => bincode::serialize(p),
        Frame::HeartbeatAck(p) => bincode::serialize(p),
        Frame::Request(p) => bincode::serialize(p),
        Frame::Response(p) => bincode::serialize(p),
        Frame::RequestBodyChunk(p) => bincode::serialize(p),
        Frame::ResponseBodyChunk(p) => bincode::serialize(p),
        Frame::Disconnect(p) => bincode::serialize(p),
        Frame::Error(p) => bincode::serialize(p),
    };
    result.map_err(|e| CodecError::MalformedFrame(e.to_string()))
}

fn decode_payload(tag: u8, payload: &[u8]) -> Result<Frame, CodecError> {
    let bad = |e: bincode::Error| CodecError::MalformedFrame(e.to_string());
    Ok(match tag {
        TAG_AUTH => Frame::Auth(bincode::deserialize(payload).map_err(bad)?),
        TAG_AUTH_RESULT => Frame::AuthResult(bincode::deserialize(payload).map_err(bad)?),
        TAG_CONFIG_SYNC => Frame::ConfigSync(bincode::deserialize(payload).map_err(bad)?),
        TAG_CONFIG_ACK => Frame::ConfigAck(bincode::deserialize(payload).map_err(bad)?),
        TAG_HEARTBEAT => Frame::Heartbeat(bincode::deserialize(payload).map_err(bad)?),
        TAG_HEARTBEAT_ACK => Frame::HeartbeatAck(bincode::deserialize(payload).map_err(bad)?),
        TAG_REQUEST => Frame::Request(bincode::deserialize(payload).map_err(bad)?),
        TAG_RESPONSE => Frame::Response(bincode::deserialize(payload).map_err(bad)?),
        TAG_REQUEST_BODY_CHUNK => {
            Frame::RequestBodyChunk(bincode::deserialize(payload).map_err(bad)?)
        }
        TAG_RESPONSE_BODY_CHUNK => {
            Frame::ResponseBodyChunk(bincode::deserialize(payload).map_err(bad)?)
        }
        TAG_DISCONNECT => Frame::Disconnect(bincode::deserialize(payload).map_err(bad)?),
        TAG_ERROR => Frame::Error(bincode::deserialize(payload).map_err(bad)?),
        other => return Err(CodecError::UnknownTag(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Auth(AuthPayload {
                api_key: "a".repeat(32),
                agent_version: "1.0.0".into(),
            }),
            Frame::AuthResult(AuthResultPayload {
                success: true,
                error: None,
                gateway_version: "1.0.0".into(),
            }),
            Frame::AuthResult(AuthResultPayload {
                success: false,
                error: Some("bad key".into()),
                gateway_version: "1.0.0".into(),
            }),
            Frame::ConfigSync(ConfigSyncPayload {
                mappings: vec![],
                config_hash: "e3b0c4".into(),
            }),
            Frame::ConfigAck(ConfigAckPayload {
                success: true,
                error: None,
                config_hash: "e3b0c4".into(),
            }),
            Frame::Heartbeat(HeartbeatPayload { timestamp: 1700000000 }),
            Frame::HeartbeatAck(HeartbeatAckPayload {
                peer_ts: 1700000000,
                server_ts: 1700000001,
            }),
            Frame::Request(RequestPayload {
                request_id: uuid::Uuid::new_v4(),
                mapping_id: uuid::Uuid::new_v4(),
                method: "GET".into(),
                path: "/ping".into(),
                headers: vec![],
                body: None,
                has_more_body: false,
            }),
            Frame::Request(RequestPayload {
                request_id: uuid::Uuid::new_v4(),
                mapping_id: uuid::Uuid::new_v4(),
                method: "POST".into(),
                path: "/upload".into(),
                headers: vec![("content-type".into(), "application/octet-stream".into())],
                body: Some(vec![0u8; 65536]),
                has_more_body: true,
            }),
            Frame::Response(ResponsePayload {
                request_id: uuid::Uuid::new_v4(),
                status: 200,
                headers: vec![("content-type".into(), "text/plain".into())],
                body: Some(b"pong".to_vec()),
                has_more_body: false,
            }),
            Frame::RequestBodyChunk(BodyChunkPayload {
                request_id: uuid::Uuid::new_v4(),
                data: vec![1, 2, 3],
                is_final: false,
            }),
            Frame::ResponseBodyChunk(BodyChunkPayload {
                request_id: uuid::Uuid::new_v4(),
                data: vec![],
                is_final: true,
            }),
            Frame::Disconnect(DisconnectPayload {
                reason: "replaced".into(),
            }),
            Frame::Error(ErrorPayload {
                request_id: Some(uuid::Uuid::new_v4()),
                error: "boom".into(),
                code: 500,
            }),
            Frame::Error(ErrorPayload {
                request_id: None,
                error: "session-level".into(),
                code: 1,
            }),
        ]
    }

    #[test]
    fn round_trips_every_kind() {
        for frame in sample_frames() {
            let bytes = encode(&frame).expect("encode");
            let decoded = decode(&bytes).expect("decode");
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        let bogus_payload = vec![200u8, 1, 2, 3];
        let compressed = lz4_flex::block::compress_prepend_size(&bogus_payload);
        let err = decode(&compressed).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(200)));
    }

    #[test]
    fn rejects_malformed_frame() {
        let err = decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(_)));
    }

    #[test]
    fn accepts_cap_rejects_cap_plus_one() {
        let frame = Frame::Disconnect(DisconnectPayload {
            reason: "x".repeat(10),
        });
        let payload = encode_payload(&frame).unwrap();
        let full_len = 1 + payload.len();

        assert!(encode_with_cap(&frame, full_len).is_ok());
        assert!(matches!(
            encode_with_cap(&frame, full_len - 1),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn empty_body_and_headers_round_trip() {
        let frame = Frame::Response(ResponsePayload {
            request_id: uuid::Uuid::new_v4(),
            status: 204,
            headers: vec![],
            body: None,
            has_more_body: false,
        });
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn max_size_body_round_trips() {
        let frame = Frame::ResponseBodyChunk(BodyChunkPayload {
            request_id: uuid::Uuid::new_v4(),
            data: vec![0xAB; 64 * 1024],
            is_final: true,
        });
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode(&bytes).unwrap(), frame);
    }
}
