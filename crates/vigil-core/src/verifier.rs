//! Verification engine: one live embedding against every active enrolled template.

use crate::audit::{self, AuditEvent, AuditEventType, AuditResult, AuditSink};
use crate::cipher::{self, TemplateCipher, UserKey};
use crate::types::{is_match, AuthenticationDecision, Embedding, FaceTemplate};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Default cosine similarity threshold for initial authentication.
pub const DEFAULT_AUTH_THRESHOLD: f32 = 0.6;

const SESSION_TOKEN_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("template store unavailable: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),
    #[error("verification worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Source of enrolled templates. Only templates of users whose status is
/// active are returned.
pub trait TemplateStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch_active_templates(&self) -> impl Future<Output = Result<Vec<FaceTemplate>, Self::Error>> + Send;
}

impl<T: TemplateStore> TemplateStore for Arc<T> {
    type Error = T::Error;

    fn fetch_active_templates(&self) -> impl Future<Output = Result<Vec<FaceTemplate>, Self::Error>> + Send {
        (**self).fetch_active_templates()
    }
}

/// Best match found by a full gallery scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    /// `(user_id, similarity)` of the global argmax, if anything decrypted.
    pub best: Option<(String, f32)>,
    pub compared: usize,
    pub skipped: usize,
}

/// Decrypt and compare every template. Always runs to exhaustion: no early
/// exit on a match, so the result is the global best and timing does not
/// reveal match position.
///
/// Templates that fail to decrypt are logged and skipped. When two
/// templates share the maximal similarity, which one is reported is not
/// part of the contract.
pub fn scan_templates(cipher: &TemplateCipher, live: &Embedding, templates: &[FaceTemplate]) -> ScanOutcome {
    let mut keys: HashMap<&str, UserKey> = HashMap::new();
    let mut best: Option<(usize, f32)> = None;
    let mut compared = 0usize;
    let mut skipped = 0usize;

    for (i, template) in templates.iter().enumerate() {
        let key = keys
            .entry(template.user_id.as_str())
            .or_insert_with(|| cipher.derive_key(&template.user_id));

        let stored = match cipher::open_embedding_with_key(key, &template.ciphertext) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(
                    user = %template.user_id,
                    template = %template.id,
                    error = %e,
                    "skipping template that failed to decrypt"
                );
                skipped += 1;
                continue;
            }
        };

        compared += 1;
        let sim = live.similarity(&stored);
        if best.map_or(true, |(_, b)| sim > b) {
            best = Some((i, sim));
        }
    }

    ScanOutcome {
        best: best.map(|(i, sim)| (templates[i].user_id.clone(), sim)),
        compared,
        skipped,
    }
}

/// Decides whether a live embedding belongs to an enrolled, active user.
pub struct Verifier<S> {
    store: S,
    cipher: Arc<TemplateCipher>,
    audit: Arc<dyn AuditSink>,
    threshold: f32,
}

impl<S: TemplateStore> Verifier<S> {
    pub fn new(store: S, cipher: Arc<TemplateCipher>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            cipher,
            audit,
            threshold: DEFAULT_AUTH_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn verify(&self, live: &Embedding) -> Result<AuthenticationDecision, VerifyError> {
        self.verify_with_threshold(live, self.threshold).await
    }

    pub async fn verify_with_threshold(
        &self,
        live: &Embedding,
        threshold: f32,
    ) -> Result<AuthenticationDecision, VerifyError> {
        let templates = self
            .store
            .fetch_active_templates()
            .await
            .map_err(|e| VerifyError::Store(Box::new(e)))?;

        let total = templates.len();
        let cipher = Arc::clone(&self.cipher);
        let candidate = live.clone();
        // Key derivation is deliberately slow; keep it off the async workers.
        let outcome =
            tokio::task::spawn_blocking(move || scan_templates(&cipher, &candidate, &templates)).await?;

        tracing::debug!(
            templates = total,
            compared = outcome.compared,
            skipped = outcome.skipped,
            "verification scan complete"
        );

        let decision = match outcome.best {
            Some((user_id, sim)) if is_match(sim, threshold) => AuthenticationDecision {
                success: true,
                matched_user_id: Some(user_id),
                confidence: sim,
                session_token: Some(new_session_token()),
            },
            Some((_, sim)) => AuthenticationDecision::rejected(sim),
            None => AuthenticationDecision::rejected(0.0),
        };

        let event = AuditEvent::new(
            AuditEventType::Authentication,
            if decision.success { AuditResult::Success } else { AuditResult::Failure },
        )
        .confidence(decision.confidence);
        let event = match &decision.matched_user_id {
            Some(user) => event.user(user.clone()),
            None if total == 0 => event.reason("no_templates"),
            None if outcome.compared == 0 => event.reason("no_decryptable_templates"),
            None => event.reason("below_threshold"),
        };
        audit::record(self.audit.as_ref(), event);

        if decision.success {
            tracing::info!(
                user = decision.matched_user_id.as_deref().unwrap_or_default(),
                similarity = decision.confidence,
                "authentication succeeded"
            );
        } else {
            tracing::info!(similarity = decision.confidence, threshold, "authentication rejected");
        }

        Ok(decision)
    }
}

/// Opaque session token: 32 CSPRNG bytes, URL-safe base64.
pub fn new_session_token() -> String {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Error)]
    #[error("store offline")]
    pub struct StoreOffline;

    /// In-memory store; `None` simulates an unreachable backend.
    pub struct MemoryStore(pub Option<Vec<FaceTemplate>>);

    impl TemplateStore for MemoryStore {
        type Error = StoreOffline;

        async fn fetch_active_templates(&self) -> Result<Vec<FaceTemplate>, StoreOffline> {
            self.0.clone().ok_or(StoreOffline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use crate::audit::testing::MemorySink;
    use crate::cipher::MasterSecret;
    use crate::types::{axis, with_similarity};
    use chrono::Utc;

    fn cipher() -> Arc<TemplateCipher> {
        Arc::new(TemplateCipher::with_iterations(MasterSecret::new("master").unwrap(), 1_000))
    }

    fn template(cipher: &TemplateCipher, id: &str, user: &str, embedding: &Embedding) -> FaceTemplate {
        FaceTemplate {
            id: id.into(),
            user_id: user.into(),
            ciphertext: cipher.seal_embedding(embedding, user).unwrap(),
            quality_score: 0.9,
            created_at: Utc::now(),
        }
    }

    fn verifier(templates: Option<Vec<FaceTemplate>>, cipher: Arc<TemplateCipher>) -> (Verifier<MemoryStore>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Verifier::new(MemoryStore(templates), cipher, sink.clone()), sink)
    }

    #[tokio::test]
    async fn empty_store_fails_with_zero_confidence() {
        let (v, sink) = verifier(Some(vec![]), cipher());
        let decision = v.verify(&axis(0)).await.unwrap();
        assert_eq!(decision, AuthenticationDecision::rejected(0.0));
        let events = sink.events.lock().unwrap();
        assert_eq!(events[0].reason.as_deref(), Some("no_templates"));
    }

    #[tokio::test]
    async fn picks_global_best_not_first_above_threshold() {
        let c = cipher();
        let templates = vec![
            template(&c, "t1", "ann", &with_similarity(0.2)),
            template(&c, "t2", "bob", &with_similarity(0.9)),
            template(&c, "t3", "cid", &with_similarity(0.55)),
        ];
        let (v, _) = verifier(Some(templates), c);
        let decision = v.verify(&axis(0)).await.unwrap();
        assert!(decision.success);
        assert_eq!(decision.matched_user_id.as_deref(), Some("bob"));
        assert!((decision.confidence - 0.9).abs() < 1e-5);
        assert!(decision.session_token.is_some());
    }

    #[tokio::test]
    async fn best_later_in_scan_wins_over_earlier_match() {
        let c = cipher();
        let templates = vec![
            template(&c, "t1", "ann", &with_similarity(0.7)),
            template(&c, "t2", "bob", &with_similarity(0.95)),
        ];
        let (v, _) = verifier(Some(templates), c);
        let decision = v.verify(&axis(0)).await.unwrap();
        assert_eq!(decision.matched_user_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn concrete_axis_scenario() {
        let c = cipher();
        let templates = vec![template(&c, "t", "alice", &axis(0))];
        let (v, _) = verifier(Some(templates), c);

        let hit = v.verify(&axis(0)).await.unwrap();
        assert!(hit.success);
        assert!((hit.confidence - 1.0).abs() < 1e-6);

        let miss = v.verify(&axis(1)).await.unwrap();
        assert!(!miss.success);
        assert_eq!(miss.matched_user_id, None);
        assert_eq!(miss.session_token, None);
        assert!(miss.confidence.abs() < 1e-6);
    }

    #[tokio::test]
    async fn below_threshold_reports_best_confidence() {
        let c = cipher();
        let templates = vec![template(&c, "t", "alice", &with_similarity(0.55))];
        let (v, _) = verifier(Some(templates), c);
        let decision = v.verify(&axis(0)).await.unwrap();
        assert!(!decision.success);
        assert!((decision.confidence - 0.55).abs() < 1e-5);
    }

    #[tokio::test]
    async fn corrupt_template_is_skipped_not_fatal() {
        let c = cipher();
        let mut broken = template(&c, "bad", "mallory", &axis(0));
        let last = broken.ciphertext.len() - 1;
        broken.ciphertext[last] ^= 0x01;
        let foreign = FaceTemplate {
            ciphertext: TemplateCipher::with_iterations(MasterSecret::new("old").unwrap(), 1_000)
                .seal_embedding(&axis(0), "eve")
                .unwrap(),
            ..template(&c, "old", "eve", &axis(0))
        };
        let good = template(&c, "good", "alice", &with_similarity(0.8));

        let outcome = scan_templates(&c, &axis(0), &[broken.clone(), foreign.clone(), good.clone()]);
        assert_eq!(outcome.compared, 1);
        assert_eq!(outcome.skipped, 2);

        let (v, _) = verifier(Some(vec![broken, foreign, good]), c);
        let decision = v.verify(&axis(0)).await.unwrap();
        assert_eq!(decision.matched_user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn undecryptable_gallery_has_its_own_audit_reason() {
        let c = cipher();
        let mut broken = template(&c, "bad", "alice", &axis(0));
        broken.ciphertext[0] ^= 0x80;
        let (v, sink) = verifier(Some(vec![broken]), c);

        let decision = v.verify(&axis(0)).await.unwrap();
        assert_eq!(decision, AuthenticationDecision::rejected(0.0));
        let events = sink.events.lock().unwrap();
        assert_eq!(events[0].reason.as_deref(), Some("no_decryptable_templates"));
    }

    #[tokio::test]
    async fn below_threshold_is_audited_as_such() {
        let c = cipher();
        let templates = vec![template(&c, "t", "alice", &with_similarity(0.3))];
        let (v, sink) = verifier(Some(templates), c);
        v.verify(&axis(0)).await.unwrap();
        assert_eq!(sink.events.lock().unwrap()[0].reason.as_deref(), Some("below_threshold"));
    }

    #[tokio::test]
    async fn non_positive_similarity_never_matches() {
        let c = cipher();
        let templates = vec![template(&c, "t", "alice", &axis(1))];
        let (v, _) = verifier(Some(templates), c);
        let decision = v.verify_with_threshold(&axis(0), -0.5).await.unwrap();
        assert!(!decision.success);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let (v, _) = verifier(None, cipher());
        assert!(matches!(v.verify(&axis(0)).await, Err(VerifyError::Store(_))));
    }

    #[tokio::test]
    async fn audit_failure_does_not_abort_decision() {
        let c = cipher();
        let templates = vec![template(&c, "t", "alice", &axis(0))];
        let sink = Arc::new(MemorySink { fail: true, ..Default::default() });
        let v = Verifier::new(MemoryStore(Some(templates)), c, sink);
        assert!(v.verify(&axis(0)).await.unwrap().success);
    }

    #[test]
    fn session_tokens_are_unique() {
        let a = new_session_token();
        assert_eq!(a.len(), 43);
        assert_ne!(a, new_session_token());
    }
}
