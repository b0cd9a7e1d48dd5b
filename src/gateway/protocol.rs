//! Wire Protocol
//!
//! Envelopes exchanged between clients and a shard gateway, and the framing
//! that carries them: a 4-byte little-endian length prefix followed by a JSON
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Inbound call: invoke `method` with `args`, correlated by `seq`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub seq: i64,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Vec<Value>, seq: i64) -> Self {
        Self {
            method: method.into(),
            args,
            seq,
        }
    }
}

/// Outbound reply. Exactly one of `err` and `data` carries information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    pub err: Option<String>,
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(seq: i64, data: Value) -> Self {
        Self {
            seq,
            err: None,
            data: Some(data),
        }
    }

    pub fn error(seq: i64, err: impl Into<String>) -> Self {
        Self {
            seq,
            err: Some(err.into()),
            data: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }
}

/// Framing and envelope errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A payload that could not be decoded into a [`Request`].
///
/// `seq` is recovered when the payload was a JSON object with an integer
/// `seq`, so the caller can still answer it.
#[derive(Debug, Error)]
#[error("invalid request: {reason}")]
pub struct MalformedRequest {
    pub seq: Option<i64>,
    pub reason: String,
}

/// Decode one request payload
pub fn decode_request(payload: &[u8]) -> Result<Request, MalformedRequest> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| MalformedRequest {
        seq: None,
        reason: e.to_string(),
    })?;
    let seq = value.get("seq").and_then(Value::as_i64);
    serde_json::from_value(value).map_err(|e| MalformedRequest {
        seq,
        reason: e.to_string(),
    })
}

/// Serialize a message into a length-prefixed frame
pub fn encode_frame<T: Serialize>(msg: &T, limit: usize) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > limit || payload.len() > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            limit,
        });
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Read one frame payload.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_le_bytes(len_buf) as usize;
    if size > limit {
        return Err(ProtocolError::FrameTooLarge { size, limit });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Encode and write one message, flushing afterwards
pub async fn write_frame<W, T>(writer: &mut W, msg: &T, limit: usize) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg, limit)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    fn test_response_envelope_shape() {
        let ok = serde_json::to_value(Response::ok(7, json!("v1"))).unwrap();
        assert_eq!(ok, json!({"seq": 7, "err": null, "data": "v1"}));

        let err = serde_json::to_value(Response::error(3, "boom")).unwrap();
        assert_eq!(err, json!({"seq": 3, "err": "boom", "data": null}));
    }

    #[test]
    fn test_decode_request_defaults_args() {
        let req = decode_request(br#"{"method": "info", "seq": 1}"#).unwrap();
        assert_eq!(req, Request::new("info", vec![], 1));
    }

    #[test]
    fn test_decode_request_recovers_seq() {
        let err = decode_request(br#"{"args": [], "seq": 12}"#).unwrap_err();
        assert_eq!(err.seq, Some(12));
        assert!(err.reason.contains("method"));

        let err = decode_request(br#"{"method": 5, "seq": "x"}"#).unwrap_err();
        assert_eq!(err.seq, None);

        let err = decode_request(b"not json").unwrap_err();
        assert_eq!(err.seq, None);
    }

    #[test]
    fn test_decode_request_without_integer_seq() {
        for payload in [
            &br#"{"method": "info", "seq": "7"}"#[..],
            br#"{"method": "info"}"#,
            br#"{"method": "info", "seq": 1e20}"#,
            br#"{"method": "info", "seq": 1.5}"#,
        ] {
            let err = decode_request(payload).unwrap_err();
            assert_eq!(err.seq, None, "{}", String::from_utf8_lossy(payload));
        }
    }

    #[tokio::test]
    async fn test_frames_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let req = Request::new("get", vec![json!("k1")], 7);
        write_frame(&mut client, &req, LIMIT).await.unwrap();
        drop(client);

        let payload = read_frame(&mut server, LIMIT).await.unwrap().unwrap();
        assert_eq!(decode_request(&payload).unwrap(), req);
        assert!(read_frame(&mut server, LIMIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, &Request::new("x", vec![json!("a".repeat(200))], 1), LIMIT)
            .await
            .unwrap();

        let err = read_frame(&mut server, 64).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { limit: 64, .. }));

        let err = encode_frame(&Response::ok(1, json!("a".repeat(100))), 16).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }
}
