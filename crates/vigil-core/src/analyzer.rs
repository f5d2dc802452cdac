//! Seams to the external collaborators the guard and daemon depend on.

use crate::types::{BoundingBox, Embedding, LockReason};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// A camera frame as produced by the external capture side.
#[derive(Clone)]
pub struct Frame {
    /// JPEG-encoded image.
    pub jpeg: Vec<u8>,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(jpeg: Vec<u8>) -> Self {
        Self {
            jpeg,
            captured_at: Instant::now(),
        }
    }
}

/// Face detection and embedding extraction, backed by the detection engine.
pub trait FaceAnalyzer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn detect(&self, jpeg: &[u8]) -> impl Future<Output = Result<Vec<BoundingBox>, Self::Error>> + Send;

    fn extract_embedding(
        &self,
        jpeg: &[u8],
        face: Option<&BoundingBox>,
    ) -> impl Future<Output = Result<Embedding, Self::Error>> + Send;
}

impl<T: FaceAnalyzer> FaceAnalyzer for Arc<T> {
    type Error = T::Error;

    fn detect(&self, jpeg: &[u8]) -> impl Future<Output = Result<Vec<BoundingBox>, Self::Error>> + Send {
        (**self).detect(jpeg)
    }

    fn extract_embedding(
        &self,
        jpeg: &[u8],
        face: Option<&BoundingBox>,
    ) -> impl Future<Output = Result<Embedding, Self::Error>> + Send {
        (**self).extract_embedding(jpeg, face)
    }
}

/// Latest-frame provider. `None` means no frame is available right now.
pub trait FrameSource: Send + Sync {
    fn current_frame(&self) -> impl Future<Output = Option<Frame>> + Send;
}

impl<T: FrameSource> FrameSource for Arc<T> {
    fn current_frame(&self) -> impl Future<Output = Option<Frame>> + Send {
        (**self).current_frame()
    }
}

/// Workstation session control.
pub trait SessionLock: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn lock(&self, reason: LockReason) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn unlock(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl<T: SessionLock> SessionLock for Arc<T> {
    type Error = T::Error;

    fn lock(&self, reason: LockReason) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).lock(reason)
    }

    fn unlock(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).unlock()
    }
}
