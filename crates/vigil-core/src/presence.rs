//! Presence guard: continuous re-verification after authentication.
//!
//! Once a reference embedding is installed, a single cooperative timer
//! samples the detection engine and decides, each tick, whether the
//! authenticated person is still the only face in front of the camera.
//! Violations are reported to the [`SessionLock`] at most once until the
//! lock is cleared.

use crate::analyzer::{FaceAnalyzer, Frame, FrameSource, SessionLock};
use crate::audit::{self, AuditEvent, AuditEventType, AuditResult, AuditSink};
use crate::types::{is_match, BoundingBox, Embedding, LockReason, PresenceState, PresenceUpdate};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tunables for the guard.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub poll_interval: Duration,
    pub absence_timeout: Duration,
    /// Presence re-confirmation threshold; looser than authentication on purpose.
    pub match_threshold: f32,
    /// Frames older than this count as no frame at all.
    pub frame_max_age: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            absence_timeout: Duration::from_secs(5),
            match_threshold: 0.5,
            frame_max_age: Duration::from_secs(1),
        }
    }
}

/// The identity the guard is protecting.
#[derive(Debug, Clone)]
pub struct Reference {
    pub user_id: String,
    pub embedding: Embedding,
}

/// Monitoring lifecycle snapshot for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardStatus {
    pub monitoring: bool,
    pub locked: bool,
    pub user_id: Option<String>,
    pub last_update: Option<PresenceUpdate>,
}

/// Per-run cancellation flag. A run that has been stopped never requests a lock.
#[derive(Default)]
struct RunToken {
    cancelled: AtomicBool,
}

impl RunToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct MonitorTask {
    token: Arc<RunToken>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared<A, F, L> {
    analyzer: A,
    frames: F,
    lock: L,
    audit: Arc<dyn AuditSink>,
    config: PresenceConfig,
    reference: RwLock<Option<Arc<Reference>>>,
    absence_started: Mutex<Option<Instant>>,
    locked: AtomicBool,
    last_update: Mutex<Option<PresenceUpdate>>,
    events: broadcast::Sender<PresenceUpdate>,
}

/// Presence guard over a face analyzer, a frame source and a session lock.
pub struct PresenceGuard<A, F, L> {
    shared: Arc<Shared<A, F, L>>,
    task: Mutex<Option<MonitorTask>>,
}

impl<A, F, L> PresenceGuard<A, F, L>
where
    A: FaceAnalyzer + 'static,
    F: FrameSource + 'static,
    L: SessionLock + 'static,
{
    pub fn new(analyzer: A, frames: F, lock: L, audit: Arc<dyn AuditSink>, config: PresenceConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                analyzer,
                frames,
                lock,
                audit,
                config,
                reference: RwLock::new(None),
                absence_started: Mutex::new(None),
                locked: AtomicBool::new(false),
                last_update: Mutex::new(None),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.shared.config
    }

    /// Install the reference for a freshly authenticated user.
    ///
    /// Starts a new protection period: the absence timer and any pending
    /// lock flag are cleared.
    pub fn set_reference(&self, user_id: impl Into<String>, embedding: Embedding) {
        let reference = Arc::new(Reference {
            user_id: user_id.into(),
            embedding,
        });
        tracing::info!(user = %reference.user_id, "presence reference installed");
        *self.shared.reference.write().unwrap_or_else(PoisonError::into_inner) = Some(reference);
        *self.shared.absence() = None;
        self.shared.locked.store(false, Ordering::Release);
    }

    pub fn has_reference(&self) -> bool {
        self.shared.reference_snapshot().is_some()
    }

    /// Record that the session was unlocked externally; later violations lock again.
    pub fn mark_unlocked(&self) {
        if self.shared.locked.swap(false, Ordering::AcqRel) {
            tracing::info!("presence lock flag cleared");
        }
        *self.shared.absence() = None;
    }

    pub fn is_locked(&self) -> bool {
        self.shared.locked.load(Ordering::Acquire)
    }

    pub fn is_monitoring(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> GuardStatus {
        GuardStatus {
            monitoring: self.is_monitoring(),
            locked: self.is_locked(),
            user_id: self.shared.reference_snapshot().map(|r| r.user_id.clone()),
            last_update: self
                .shared
                .last_update
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Start the polling timer. Returns `false` without starting anything
    /// when no reference is installed, the poll interval is zero, or
    /// monitoring is already running.
    pub fn start_monitoring(&self) -> bool {
        if self.shared.config.poll_interval.is_zero() {
            tracing::error!("presence poll interval is zero; refusing to start monitoring");
            return false;
        }
        if !self.has_reference() {
            tracing::warn!("start_monitoring called without a reference embedding; ignoring");
            return false;
        }

        let mut slot = self.task_slot();
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::debug!("presence monitoring already running");
            return false;
        }

        let token = Arc::new(RunToken::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let run_token = Arc::clone(&token);
        let handle = tokio::spawn(async move { shared.run(run_token, stop_rx).await });

        tracing::info!(
            interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            absence_timeout_ms = self.shared.config.absence_timeout.as_millis() as u64,
            "presence monitoring started"
        );
        *slot = Some(MonitorTask { token, stop_tx, handle });
        true
    }

    /// Halt the timer and wait for the in-flight tick to be dropped.
    /// Idempotent; the reference embedding is kept.
    pub async fn stop_monitoring(&self) {
        let Some(task) = self.task_slot().take() else {
            return;
        };
        task.token.cancelled.store(true, Ordering::Release);
        let _ = task.stop_tx.send(true);
        if let Err(e) = task.handle.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "presence task ended abnormally");
            }
        }
        tracing::info!("presence monitoring stopped");
    }

    /// Run one evaluation outside the timer. `None` when no reference is installed.
    pub async fn tick(&self) -> Option<PresenceUpdate> {
        let update = self.shared.evaluate(&RunToken::default()).await?;
        self.shared.publish(&update);
        Some(update)
    }

    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<MonitorTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A, F, L> Drop for PresenceGuard<A, F, L> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.token.cancelled.store(true, Ordering::Release);
            task.handle.abort();
        }
    }
}

impl<A, F, L> Shared<A, F, L>
where
    A: FaceAnalyzer,
    F: FrameSource,
    L: SessionLock,
{
    async fn run(&self, token: Arc<RunToken>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        // A tick that overruns the interval swallows the ticks it missed.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            let update = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                update = self.evaluate(&token) => update,
            };

            match update {
                Some(update) => self.publish(&update),
                None => {
                    tracing::warn!("reference embedding missing; presence monitoring exiting");
                    break;
                }
            }
        }
    }

    fn reference_snapshot(&self) -> Option<Arc<Reference>> {
        self.reference
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn absence(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.absence_started.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, update: &PresenceUpdate) {
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(update.clone());
        // No subscribers is fine.
        let _ = self.events.send(update.clone());
    }

    async fn evaluate(&self, token: &RunToken) -> Option<PresenceUpdate> {
        let reference = self.reference_snapshot()?;

        let Some(frame) = self.fresh_frame().await else {
            return Some(self.on_no_face(&reference, token).await);
        };

        let faces = match self.analyzer.detect(&frame.jpeg).await {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; retrying next tick");
                return Some(PresenceUpdate::new(PresenceState::CameraError));
            }
        };

        let update = match faces.len() {
            0 => self.on_no_face(&reference, token).await,
            1 => self.on_single_face(&reference, &frame, &faces[0], token).await,
            count => {
                tracing::warn!(count, user = %reference.user_id, "multiple faces in view");
                let locked = self.request_lock(LockReason::MultipleFaces, &reference, None, token).await;
                PresenceUpdate {
                    lock_requested: locked,
                    ..PresenceUpdate::new(PresenceState::MultipleFaces)
                }
            }
        };
        Some(update)
    }

    async fn fresh_frame(&self) -> Option<Frame> {
        let frame = self.frames.current_frame().await?;
        let age = Instant::now().saturating_duration_since(frame.captured_at);
        if age > self.config.frame_max_age {
            tracing::debug!(age_ms = age.as_millis() as u64, "discarding stale frame");
            return None;
        }
        Some(frame)
    }

    async fn on_no_face(&self, reference: &Reference, token: &RunToken) -> PresenceUpdate {
        let now = Instant::now();
        let elapsed = {
            let mut started = self.absence();
            match *started {
                None => {
                    *started = Some(now);
                    None
                }
                Some(at) => Some(now.saturating_duration_since(at)),
            }
        };

        let Some(elapsed) = elapsed else {
            tracing::debug!(user = %reference.user_id, "face left view; absence timer started");
            return PresenceUpdate {
                absence_duration: Some(Duration::ZERO),
                ..PresenceUpdate::new(PresenceState::NoFace)
            };
        };

        let locked = if elapsed >= self.config.absence_timeout {
            self.request_lock(LockReason::NoFace, reference, None, token).await
        } else {
            false
        };

        PresenceUpdate {
            absence_duration: Some(elapsed),
            lock_requested: locked,
            ..PresenceUpdate::new(PresenceState::NoFace)
        }
    }

    async fn on_single_face(
        &self,
        reference: &Reference,
        frame: &Frame,
        face: &BoundingBox,
        token: &RunToken,
    ) -> PresenceUpdate {
        let live = match self.analyzer.extract_embedding(&frame.jpeg, Some(face)).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "embedding extraction failed; retrying next tick");
                return PresenceUpdate::new(PresenceState::CameraError);
            }
        };

        let similarity = live.similarity(&reference.embedding);
        if is_match(similarity, self.config.match_threshold) {
            *self.absence() = None;
            return PresenceUpdate {
                similarity: Some(similarity),
                ..PresenceUpdate::new(PresenceState::Authenticated)
            };
        }

        tracing::warn!(user = %reference.user_id, similarity, "unrecognized face in view");
        let locked = self
            .request_lock(LockReason::UnauthorizedFace, reference, Some(similarity), token)
            .await;
        PresenceUpdate {
            similarity: Some(similarity),
            lock_requested: locked,
            ..PresenceUpdate::new(PresenceState::UnauthorizedFace)
        }
    }

    /// Invoke the session lock unless one is already requested. Returns
    /// whether this call performed the lock.
    async fn request_lock(
        &self,
        reason: LockReason,
        reference: &Reference,
        similarity: Option<f32>,
        token: &RunToken,
    ) -> bool {
        if token.is_cancelled() {
            return false;
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut event = AuditEvent::new(AuditEventType::SessionLock, AuditResult::Success)
            .user(reference.user_id.clone())
            .reason(reason.as_str());
        if let Some(sim) = similarity {
            event = event.confidence(sim);
        }

        match self.lock.lock(reason).await {
            Ok(()) => {
                tracing::info!(user = %reference.user_id, %reason, "session locked");
                audit::record(self.audit.as_ref(), event);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, %reason, "session lock failed; will retry");
                // Let a later tick try again.
                self.locked.store(false, Ordering::Release);
                event.result = AuditResult::Failure;
                audit::record(self.audit.as_ref(), event);
                false
            }
        }
    }
}
