//! Wire protocol: framing and message envelopes.
//!
//! Each message on the socket is one frame:
//!
//! ```text
//! [u32 BE total][u16 BE meta_len][meta JSON][payload]
//! ```
//!
//! `total` counts everything after itself. `meta` is a [`PayloadMeta`]
//! describing how the payload bytes were encoded (format, compression), so
//! the receiver decodes from the sender's metadata rather than its own
//! configuration. The payload is a request or response body encoded by
//! [`crate::serialization::Serializer`].

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::serialization::{PayloadMeta, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub function: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Caller identity for access control.
    #[serde(default)]
    pub client_id: String,
}

/// Error body carried in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    /// Error variant name, for re-raising a matching error on the caller.
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Reply to one [`RpcRequest`]. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: &RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                code: error.to_rpc_error_code(),
                message: error.to_string(),
                type_name: error.type_name().to_string(),
            }),
        }
    }

    /// Unpack into the call result, re-raising a carried error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(body) => Err(RpcError::Remote {
                type_name: body.type_name,
                message: body.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Serialize a body and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, serializer: &Serializer, body: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let value = serde_json::to_value(body)?;
    let (payload, meta) = serializer.encode(&value)?;
    write_frame(writer, &meta, &payload).await
}

/// Read one frame and deserialize its body.
pub async fn read_message<R, T>(reader: &mut R, serializer: &Serializer) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let (meta, payload) = read_frame(reader).await?;
    let value = serializer.decode(&payload, &meta)?;
    serde_json::from_value(value).map_err(|e| RpcError::Decode {
        message: format!("Malformed message body: {}", e),
    })
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    meta: &PayloadMeta,
    payload: &[u8],
) -> Result<()> {
    let meta_bytes = serde_json::to_vec(meta)?;
    if meta_bytes.len() > u16::MAX as usize {
        return Err(RpcError::Encode {
            message: format!("Frame metadata too large: {} bytes", meta_bytes.len()),
        });
    }
    let total = 2 + meta_bytes.len() + payload.len();
    if total > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(RpcError::Encode {
            message: format!(
                "Frame of {} bytes exceeds the {} byte limit",
                total,
                RpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    writer.write_all(&(total as u32).to_be_bytes()).await?;
    writer.write_all(&(meta_bytes.len() as u16).to_be_bytes()).await?;
    writer.write_all(&meta_bytes).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(PayloadMeta, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let total = u32::from_be_bytes(len_buf) as usize;
    if total > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(RpcError::Decode {
            message: format!(
                "Peer announced a frame of {} bytes, above the {} byte limit",
                total,
                RpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut meta_len_buf = [0u8; 2];
    reader.read_exact(&mut meta_len_buf).await?;
    let meta_len = u16::from_be_bytes(meta_len_buf) as usize;
    if total < 2 + meta_len {
        return Err(RpcError::Decode {
            message: "Frame metadata length exceeds frame size".to_string(),
        });
    }

    let mut meta_bytes = vec![0u8; meta_len];
    reader.read_exact(&mut meta_bytes).await?;
    let meta: PayloadMeta = serde_json::from_slice(&meta_bytes).map_err(|e| RpcError::Decode {
        message: format!("Malformed frame metadata: {}", e),
    })?;

    let mut payload = vec![0u8; total - 2 - meta_len];
    reader.read_exact(&mut payload).await?;
    Ok((meta, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::WireFormat;
    use serde_json::json;

    fn request(id: u64, function: &str) -> RpcRequest {
        let mut kwargs = Map::new();
        kwargs.insert("side".to_string(), json!("left"));
        RpcRequest {
            id,
            function: function.to_string(),
            kwargs,
            client_id: "test-client".to_string(),
        }
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let serializer = Serializer::default();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        write_message(&mut client, &serializer, &request(7, "mirror_joints"))
            .await
            .unwrap();
        let received: RpcRequest = read_message(&mut server, &serializer).await.unwrap();

        assert_eq!(received.id, 7);
        assert_eq!(received.function, "mirror_joints");
        assert_eq!(received.kwargs["side"], json!("left"));
        assert_eq!(received.client_id, "test-client");
    }

    #[tokio::test]
    async fn test_roundtrip_across_formats() {
        // Sender on msgpack, receiver decodes from the frame metadata.
        let sender = Serializer::new(WireFormat::MsgPack, RpcConfig::COMPRESSION_THRESHOLD);
        let receiver = Serializer::default();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        write_message(&mut client, &sender, &RpcResponse::ok(3, json!([1, 2])))
            .await
            .unwrap();
        let received: RpcResponse = read_message(&mut server, &receiver).await.unwrap();

        assert_eq!(received.id, 3);
        assert_eq!(received.into_result().unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_error_response_reraises() {
        let serializer = Serializer::default();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let original = RpcError::FunctionNotRegistered {
            name: "missing".to_string(),
        };
        write_message(&mut client, &serializer, &RpcResponse::err(1, &original))
            .await
            .unwrap();
        let received: RpcResponse = read_message(&mut server, &serializer).await.unwrap();

        let body = received.error.clone().unwrap();
        assert_eq!(body.code, original.to_rpc_error_code());
        assert_eq!(body.type_name, original.type_name());
        match received.into_result() {
            Err(RpcError::Remote { message, .. }) => assert!(message.contains("missing")),
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_announced_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let bogus = ((RpcConfig::MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
            .await
            .unwrap();

        let result: Result<RpcRequest> =
            read_message(&mut server, &Serializer::default()).await;
        assert!(matches!(result, Err(RpcError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_inconsistent_meta_len_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        // total = 4 but meta_len = 100.
        let mut frame = Vec::new();
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(&100u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 2]);
        tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
            .await
            .unwrap();

        let result: Result<RpcRequest> =
            read_message(&mut server, &Serializer::default()).await;
        assert!(matches!(result, Err(RpcError::Decode { .. })));
    }

    #[test]
    fn test_response_exactly_one_side() {
        let ok = RpcResponse::ok(1, json!(true));
        assert!(ok.result.is_some() && ok.error.is_none());

        let err = RpcResponse::err(1, &RpcError::TaskCancelled);
        assert!(err.result.is_none() && err.error.is_some());
    }
}
