//! Detection engine client over a Unix domain socket.

use crate::error::IpcError;
use crate::protocol::{
    read_message, write_message, Command, DetectData, EmbeddingData, EnrollCaptureData, Request,
    Response, DEFAULT_SOCKET_PATH,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use vigil_core::{BoundingBox, Embedding, FaceAnalyzer};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub ping_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout: Duration::from_millis(2000),
            request_timeout: Duration::from_millis(2000),
            ping_timeout: Duration::from_millis(500),
        }
    }
}

/// Result of an `ENROLL_CAPTURE` call.
#[derive(Debug, Clone)]
pub struct EnrollCapture {
    pub embedding: Embedding,
    pub confidence: f32,
    pub quality_score: f32,
}

/// Strictly sequential client: one request in flight per connection, and a
/// connection that saw a transport error or timeout is discarded so a late
/// reply can never be taken as the answer to the next request.
pub struct DetectionClient {
    config: ClientConfig,
    conn: Mutex<Option<UnixStream>>,
}

impl DetectionClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn connect(&self) -> Result<UnixStream, IpcError> {
        let path = &self.config.socket_path;
        let stream = timeout(self.config.connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| IpcError::Timeout {
                operation: "connect",
                after: self.config.connect_timeout,
            })?
            .map_err(|source| IpcError::Connect {
                path: path.display().to_string(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "connected to detection engine");
        Ok(stream)
    }

    /// Send one request and wait for its response envelope.
    pub async fn call(&self, request: &Request, limit: Duration) -> Result<Response, IpcError> {
        let mut slot = self.conn.lock().await;
        let stream = match &mut *slot {
            Some(stream) => stream,
            empty => empty.insert(self.connect().await?),
        };

        let exchange = async {
            write_message(stream, request).await?;
            read_message::<_, Response>(stream).await
        };

        let result = match timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Timeout {
                operation: "request",
                after: limit,
            }),
        };

        if let Err(e) = &result {
            if e.poisons_connection() {
                tracing::debug!(error = %e, command = ?request.command, "dropping engine connection");
                *slot = None;
            }
        }
        result
    }

    pub async fn detect_faces(&self, jpeg: &[u8]) -> Result<Vec<BoundingBox>, IpcError> {
        let request = Request::new(Command::Detect).with_frame(jpeg);
        let data: DetectData = self.call(&request, self.config.request_timeout).await?.into_data()?;
        Ok(data.faces.into_iter().map(BoundingBox::from).collect())
    }

    pub async fn embedding(&self, jpeg: &[u8], face: Option<&BoundingBox>) -> Result<Embedding, IpcError> {
        let mut request = Request::new(Command::ExtractEmbedding).with_frame(jpeg);
        if let Some(face) = face {
            request = request.with_bbox(face);
        }
        let data: EmbeddingData = self.call(&request, self.config.request_timeout).await?.into_data()?;
        Embedding::new(data.embedding).map_err(|e| IpcError::InvalidResponse(e.to_string()))
    }

    pub async fn enroll_capture(&self, jpeg: &[u8]) -> Result<EnrollCapture, IpcError> {
        let request = Request::new(Command::EnrollCapture).with_frame(jpeg);
        let data: EnrollCaptureData = self.call(&request, self.config.request_timeout).await?.into_data()?;
        Ok(EnrollCapture {
            embedding: Embedding::new(data.embedding)
                .map_err(|e| IpcError::InvalidResponse(e.to_string()))?,
            confidence: data.confidence,
            quality_score: data.quality_score,
        })
    }

    /// Liveness check. Any well-formed envelope within the ping timeout
    /// counts as alive, including an engine that rejects the command.
    pub async fn ping(&self) -> Result<Duration, IpcError> {
        let started = Instant::now();
        let response = self.call(&Request::new(Command::Ping), self.config.ping_timeout).await?;
        if !response.success {
            tracing::debug!(error = ?response.error, "engine answered ping with an error");
        }
        Ok(started.elapsed())
    }
}

impl FaceAnalyzer for DetectionClient {
    type Error = IpcError;

    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<BoundingBox>, IpcError> {
        self.detect_faces(jpeg).await
    }

    async fn extract_embedding(&self, jpeg: &[u8], face: Option<&BoundingBox>) -> Result<Embedding, IpcError> {
        self.embedding(jpeg, face).await
    }
}
