use crate::store::{FileTemplateStore, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use vigil_core::audit::{self, AuditEvent, AuditEventType, AuditResult, AuditSink};
use vigil_core::{
    AuthenticationDecision, CipherError, FaceTemplate, Frame, FrameSource, PresenceConfig,
    PresenceGuard, PresenceUpdate, SessionLock, TemplateCipher, Verifier, VerifyError,
};
use vigil_ipc::{DetectionClient, IpcError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no fresh camera frame available")]
    NoFrame,
    #[error("detection engine error: {0}")]
    Analyzer(#[from] IpcError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot seal template: {0}")]
    Cipher(#[from] CipherError),
    #[error("cannot read enrollment image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("capture quality {score:.2} is below the enrollment minimum {min:.2}")]
    LowQuality { score: f32, min: f32 },
    #[error("user id must not be empty")]
    EmptyUser,
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Tunables the engine needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub auth_threshold: f32,
    pub presence: PresenceConfig,
    pub min_enroll_quality: f32,
}

/// What `Authenticate` reports back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticationReport {
    #[serde(flatten)]
    pub decision: AuthenticationDecision,
    pub faces: usize,
    /// Why the attempt was rejected before a gallery scan, if it was.
    pub reason: Option<&'static str>,
    pub monitoring: bool,
}

pub type Guard<F, L> = PresenceGuard<Arc<DetectionClient>, Arc<F>, Arc<L>>;

/// Authentication, enrollment and presence orchestration for the daemon.
pub struct Engine<F, L> {
    client: Arc<DetectionClient>,
    frames: Arc<F>,
    lock: Arc<L>,
    store: Arc<FileTemplateStore>,
    cipher: Arc<TemplateCipher>,
    verifier: Verifier<Arc<FileTemplateStore>>,
    guard: Guard<F, L>,
    audit: Arc<dyn AuditSink>,
    settings: EngineSettings,
}

impl<F, L> Engine<F, L>
where
    F: FrameSource + 'static,
    L: SessionLock + 'static,
{
    pub fn new(
        client: Arc<DetectionClient>,
        frames: Arc<F>,
        lock: Arc<L>,
        store: Arc<FileTemplateStore>,
        cipher: Arc<TemplateCipher>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> Self {
        let verifier = Verifier::new(Arc::clone(&store), Arc::clone(&cipher), Arc::clone(&audit))
            .with_threshold(settings.auth_threshold);
        let guard = PresenceGuard::new(
            Arc::clone(&client),
            Arc::clone(&frames),
            Arc::clone(&lock),
            Arc::clone(&audit),
            settings.presence.clone(),
        );
        Self {
            client,
            frames,
            lock,
            store,
            cipher,
            verifier,
            guard,
            audit,
            settings,
        }
    }

    async fn fresh_frame(&self) -> Option<Frame> {
        let frame = self.frames.current_frame().await?;
        if frame.captured_at.elapsed() > self.settings.presence.frame_max_age {
            tracing::debug!("camera frame is stale");
            return None;
        }
        Some(frame)
    }

    fn reject(&self, faces: usize, reason: &'static str) -> AuthenticationReport {
        audit::record(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventType::Authentication, AuditResult::Failure)
                .confidence(0.0)
                .reason(reason),
        );
        tracing::info!(faces, reason, "authentication rejected before scan");
        AuthenticationReport {
            decision: AuthenticationDecision::rejected(0.0),
            faces,
            reason: Some(reason),
            monitoring: self.guard.is_monitoring(),
        }
    }

    /// Authenticate whoever is in front of the camera. On success the
    /// session is unlocked and presence monitoring starts for that user.
    pub async fn authenticate(&self) -> Result<AuthenticationReport, EngineError> {
        let frame = self.fresh_frame().await.ok_or(EngineError::NoFrame)?;
        let faces = self.client.detect_faces(&frame.jpeg).await?;
        let face = match faces.as_slice() {
            [] => return Ok(self.reject(0, "no_face")),
            [face] => face,
            many => return Ok(self.reject(many.len(), "multiple_faces")),
        };

        let live = self.client.embedding(&frame.jpeg, Some(face)).await?;
        let decision = self.verifier.verify(&live).await?;

        let Some(user) = decision.matched_user_id.clone().filter(|_| decision.success) else {
            return Ok(AuthenticationReport {
                decision,
                faces: 1,
                reason: None,
                monitoring: self.guard.is_monitoring(),
            });
        };

        let unlocked = match self.lock.unlock().await {
            Ok(()) => AuditResult::Success,
            Err(e) => {
                tracing::warn!(error = %e, "session unlock failed");
                AuditResult::Failure
            }
        };
        audit::record(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventType::SessionUnlock, unlocked).user(user.clone()),
        );

        self.guard.set_reference(user, live);
        self.guard.start_monitoring();
        Ok(AuthenticationReport {
            decision,
            faces: 1,
            reason: None,
            monitoring: self.guard.is_monitoring(),
        })
    }

    /// Enroll a face from a JPEG file. Returns the new template id.
    pub async fn enroll(&self, user_id: &str, image_path: &Path, replace: bool) -> Result<String, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::EmptyUser);
        }
        let jpeg = tokio::fs::read(image_path).await.map_err(|source| EngineError::Image {
            path: image_path.to_path_buf(),
            source,
        })?;

        let capture = self.client.enroll_capture(&jpeg).await?;
        let min = self.settings.min_enroll_quality;
        if capture.quality_score < min {
            audit::record(
                self.audit.as_ref(),
                AuditEvent::new(AuditEventType::Enrollment, AuditResult::Failure)
                    .user(user_id)
                    .confidence(capture.quality_score)
                    .reason("low_quality"),
            );
            return Err(EngineError::LowQuality {
                score: capture.quality_score,
                min,
            });
        }

        let cipher = Arc::clone(&self.cipher);
        let owner = user_id.to_string();
        let embedding = capture.embedding;
        let ciphertext =
            tokio::task::spawn_blocking(move || cipher.seal_embedding(&embedding, &owner)).await??;

        let template = FaceTemplate {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            ciphertext,
            quality_score: capture.quality_score,
            created_at: Utc::now(),
        };
        self.store.append(&template, replace).await?;

        audit::record(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventType::Enrollment, AuditResult::Success)
                .user(user_id)
                .confidence(capture.quality_score),
        );
        tracing::info!(
            user = user_id,
            template = %template.id,
            quality = capture.quality_score,
            detection_confidence = capture.confidence,
            "enrollment complete"
        );
        Ok(template.id)
    }

    /// Enable or disable a user's templates. Returns `false` for an unknown user.
    pub async fn set_user_active(&self, user_id: &str, active: bool) -> Result<bool, EngineError> {
        Ok(self.store.set_user_active(user_id, active).await?)
    }

    pub fn start_monitoring(&self) -> bool {
        self.guard.start_monitoring()
    }

    pub async fn stop_monitoring(&self) {
        self.guard.stop_monitoring().await
    }

    /// The session was unlocked by other means; re-arm the guard.
    pub fn clear_lock(&self) {
        self.guard.mark_unlocked();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.guard.subscribe()
    }

    pub async fn status(&self) -> serde_json::Value {
        let guard = self.guard.status();
        let engine_latency_ms = match self.client.ping().await {
            Ok(rtt) => Some(rtt.as_millis() as u64),
            Err(e) => {
                tracing::debug!(error = %e, "detection engine ping failed");
                None
            }
        };
        let (templates, active_users) = match (self.store.template_count().await, self.store.users().await) {
            (Ok(n), Ok(users)) => (Some(n), Some(users.iter().filter(|u| u.active).count())),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "template store unreadable");
                (None, None)
            }
        };
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "detector_socket": self.client.config().socket_path.display().to_string(),
            "detector_alive": engine_latency_ms.is_some(),
            "detector_latency_ms": engine_latency_ms,
            "templates": templates,
            "active_users": active_users,
            "monitoring": guard.monitoring,
            "locked": guard.locked,
            "user": guard.user_id,
            "last_update": guard.last_update,
            "auth_threshold": self.verifier.threshold(),
            "presence_threshold": self.settings.presence.match_threshold,
        })
    }
}
