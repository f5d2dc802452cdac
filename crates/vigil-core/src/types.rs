use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Dimension of every embedding produced by the detection engine.
pub const EMBEDDING_DIM: usize = 512;

/// Size in bytes of an embedding's plaintext encoding (little-endian `f32`).
pub const EMBEDDING_BYTES: usize = EMBEDDING_DIM * 4;

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    WrongDimension(usize),
    #[error("embedding component {index} is not finite")]
    NonFinite { index: usize },
    #[error("expected {EMBEDDING_BYTES} bytes of embedding data, got {0}")]
    WrongByteLength(usize),
}

/// Bounding box for a detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector, always [`EMBEDDING_DIM`] finite values.
///
/// Never persisted in plaintext: it only leaves memory through
/// [`TemplateCipher::seal_embedding`](crate::cipher::TemplateCipher::seal_embedding).
#[derive(Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Validate and wrap raw values from the detection engine.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::WrongDimension(values.len()));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Plaintext layout used for template encryption: 512 little-endian `f32`.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.len() != EMBEDDING_BYTES {
            return Err(EmbeddingError::WrongByteLength(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }
}

impl std::fmt::Debug for Embedding {
    // Biometric data stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedding")
            .field("dim", &self.values.len())
            .finish_non_exhaustive()
    }
}

/// Cosine similarity `(a·b) / (|a||b|)`.
///
/// Uses constant-time computation: always processes all dimensions.
/// Accumulates in `f64` so any finite `f32` input neither overflows nor
/// underflows; the result is clamped to [-1, 1]. A zero-norm input yields 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        ((dot / denom) as f32).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Whether a similarity counts as a match. Values <= 0 never match,
/// whatever the threshold.
pub fn is_match(similarity: f32, threshold: f32) -> bool {
    similarity > 0.0 && similarity > threshold
}

/// An encrypted-at-rest embedding belonging to one enrolled user.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTemplate {
    pub id: String,
    pub user_id: String,
    /// `nonce ‖ ciphertext ‖ tag`, opaque outside the cipher.
    pub ciphertext: Vec<u8>,
    pub quality_score: f32,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one verification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationDecision {
    pub success: bool,
    pub matched_user_id: Option<String>,
    /// Best cosine similarity observed in [-1, 1]; 0 when nothing was compared.
    pub confidence: f32,
    pub session_token: Option<String>,
}

impl AuthenticationDecision {
    pub fn rejected(confidence: f32) -> Self {
        Self {
            success: false,
            matched_user_id: None,
            confidence,
            session_token: None,
        }
    }
}

/// Observed presence state for one guard tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Authenticated,
    NoFace,
    UnauthorizedFace,
    MultipleFaces,
    CameraError,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Authenticated => "authenticated",
            PresenceState::NoFace => "no_face",
            PresenceState::UnauthorizedFace => "unauthorized_face",
            PresenceState::MultipleFaces => "multiple_faces",
            PresenceState::CameraError => "camera_error",
        }
    }
}

/// What a guard tick observed, published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceUpdate {
    pub state: PresenceState,
    #[serde(with = "duration_millis")]
    pub absence_duration: Option<Duration>,
    pub similarity: Option<f32>,
    /// True when this tick is the one that invoked the session lock.
    pub lock_requested: bool,
}

impl PresenceUpdate {
    pub fn new(state: PresenceState) -> Self {
        Self {
            state,
            absence_duration: None,
            similarity: None,
            lock_requested: false,
        }
    }
}

/// Why the guard asked for the session to be locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    NoFace,
    MultipleFaces,
    UnauthorizedFace,
}

impl LockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockReason::NoFace => "no_face",
            LockReason::MultipleFaces => "multiple_faces",
            LockReason::UnauthorizedFace => "unauthorized_face",
        }
    }
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
pub(crate) fn axis(index: usize) -> Embedding {
    let mut values = vec![0.0; EMBEDDING_DIM];
    values[index] = 1.0;
    Embedding::new(values).unwrap()
}

/// Unit vector with cosine `sim` against `axis(0)`.
#[cfg(test)]
pub(crate) fn with_similarity(sim: f32) -> Embedding {
    let mut values = vec![0.0; EMBEDDING_DIM];
    values[0] = sim;
    values[1] = (1.0 - sim * sim).sqrt();
    Embedding::new(values).unwrap()
}
