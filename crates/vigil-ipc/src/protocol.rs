//! Wire protocol for the detection engine.
//!
//! Each message is a 4-byte little-endian length followed by that many
//! bytes of UTF-8 JSON. One request gets exactly one response.

use crate::error::IpcError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vigil_core::BoundingBox;

/// Upper bound for a single framed message body.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Default socket path of the detection engine.
pub const DEFAULT_SOCKET_PATH: &str = "/run/vigil/detector.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Detect,
    ExtractEmbedding,
    EnrollCapture,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            frame_data: None,
            parameters: None,
        }
    }

    /// Attach a JPEG frame, base64-encoded.
    pub fn with_frame(mut self, jpeg: &[u8]) -> Self {
        self.frame_data = Some(STANDARD.encode(jpeg));
        self
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// Restrict extraction to a face region, as `[x, y, width, height]` in pixels.
    pub fn with_bbox(self, face: &BoundingBox) -> Self {
        let bbox = [face.x, face.y, face.width, face.height].map(|v| v.round() as i64);
        self.with_parameter("bbox", bbox.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    /// Turn the envelope into its typed payload, surfacing engine-side errors.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, IpcError> {
        if !self.success {
            return Err(IpcError::Remote(
                self.error.unwrap_or_else(|| "unspecified engine error".to_string()),
            ));
        }
        let data = self
            .data
            .ok_or_else(|| IpcError::InvalidResponse("success response without data".into()))?;
        serde_json::from_value(data).map_err(|e| IpcError::InvalidResponse(e.to_string()))
    }
}

/// One face as reported by `DETECT`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    #[serde(default)]
    pub landmarks: Option<Value>,
}

impl From<DetectedFace> for BoundingBox {
    fn from(face: DetectedFace) -> Self {
        BoundingBox {
            x: face.x,
            y: face.y,
            width: face.width,
            height: face.height,
            confidence: face.confidence,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectData {
    pub faces: Vec<DetectedFace>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingData {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollCaptureData {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub bbox: Option<Vec<f32>>,
    pub confidence: f32,
    pub quality_score: f32,
}

/// Write one length-prefixed JSON message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(IpcError::Encode)?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(IpcError::MessageTooLarge {
            len: body.len(),
            max: MAX_MESSAGE_LEN,
        });
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON message.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(IpcError::MessageTooLarge {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| IpcError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let face = BoundingBox { x: 10.4, y: 20.6, width: 99.5, height: 120.0, confidence: 0.9 };
        let req = Request::new(Command::ExtractEmbedding)
            .with_frame(&[0xFF, 0xD8, 0xFF])
            .with_bbox(&face);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            json!({
                "command": "EXTRACT_EMBEDDING",
                "frame_data": "/9j/",
                "parameters": { "bbox": [10, 21, 100, 120] }
            })
        );
    }

    #[test]
    fn ping_omits_optional_fields() {
        let json = serde_json::to_string(&Request::new(Command::Ping)).unwrap();
        assert_eq!(json, r#"{"command":"PING"}"#);
    }

    #[test]
    fn detect_response_parses_faces() {
        let resp: Response = serde_json::from_value(json!({
            "success": true,
            "data": { "faces": [
                { "x": 1, "y": 2, "width": 30, "height": 40, "confidence": 0.97, "landmarks": [] }
            ]}
        }))
        .unwrap();
        let data: DetectData = resp.into_data().unwrap();
        let face: BoundingBox = data.faces.into_iter().next().unwrap().into();
        assert_eq!(face.width, 30.0);
        assert!((face.confidence - 0.97).abs() < 1e-6);
    }

    #[test]
    fn failed_response_is_remote_error() {
        let resp: Response =
            serde_json::from_value(json!({ "success": false, "error": "No face detected" })).unwrap();
        match resp.into_data::<EmbeddingData>() {
            Err(IpcError::Remote(msg)) => assert_eq!(msg, "No face detected"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn success_without_data_is_invalid() {
        let resp = Response { success: true, data: None, error: None };
        assert!(matches!(resp.into_data::<DetectData>(), Err(IpcError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn framing_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let req = Request::new(Command::Detect).with_frame(b"jpeg bytes");
        write_message(&mut client, &req).await.unwrap();
        let received: Request = read_message(&mut server).await.unwrap();
        assert_eq!(received, req);
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_MESSAGE_LEN as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        let result: Result<Response, _> = read_message(&mut server).await;
        assert!(matches!(result, Err(IpcError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn truncated_message_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"{\"succ").await.unwrap();
        drop(client);
        let result: Result<Response, _> = read_message(&mut server).await;
        assert!(matches!(result, Err(IpcError::Io(_))));
    }
}
