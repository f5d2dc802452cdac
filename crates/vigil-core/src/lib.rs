//! vigil-core — Face template protection, verification and presence guarding.
//!
//! Templates are sealed per user with AES-256-GCM under PBKDF2-derived keys;
//! the verifier scans every active template for the best cosine match, and
//! the presence guard keeps re-checking the camera after authentication.

pub mod analyzer;
pub mod audit;
pub mod cipher;
pub mod presence;
pub mod types;
pub mod verifier;

pub use analyzer::{FaceAnalyzer, Frame, FrameSource, SessionLock};
pub use audit::{AuditEvent, AuditEventType, AuditResult, AuditSink, TracingAuditSink};
pub use cipher::{CipherError, MasterSecret, TemplateCipher};
pub use presence::{GuardStatus, PresenceConfig, PresenceGuard};
pub use types::{
    AuthenticationDecision, BoundingBox, Embedding, EmbeddingError, FaceTemplate, LockReason,
    PresenceState, PresenceUpdate, EMBEDDING_DIM,
};
pub use verifier::{TemplateStore, VerifyError, Verifier, DEFAULT_AUTH_THRESHOLD};
