use crate::engine::Engine;
use crate::frames::SnapshotFrameSource;
use crate::session::LogindSessionLock;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use vigil_core::PresenceUpdate;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface, Connection};

pub const BUS_NAME: &str = "org.freedesktop.Vigil1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

pub type DaemonEngine = Engine<SnapshotFrameSource, LogindSessionLock>;

/// D-Bus interface for the Vigil presence-guard daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
pub struct VigilService {
    engine: Arc<DaemonEngine>,
}

impl VigilService {
    pub fn new(engine: Arc<DaemonEngine>) -> Self {
        Self { engine }
    }
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Authenticate the person in front of the camera. Returns the decision as JSON.
    async fn authenticate(&self) -> fdo::Result<String> {
        tracing::info!("authenticate requested");
        let report = self.engine.authenticate().await.map_err(|e| {
            tracing::warn!(error = %e, "authentication failed");
            failed(e)
        })?;
        serde_json::to_string(&report).map_err(failed)
    }

    /// Start presence monitoring for the last authenticated user.
    async fn start_monitoring(&self) -> bool {
        self.engine.start_monitoring()
    }

    async fn stop_monitoring(&self) {
        self.engine.stop_monitoring().await
    }

    /// Tell the guard the session was unlocked by other means.
    async fn clear_lock(&self) {
        tracing::info!("clear_lock requested");
        self.engine.clear_lock()
    }

    /// Enroll a face for `user` from a JPEG on disk. Returns the template id.
    async fn enroll(&self, user: &str, image_path: &str, replace: bool) -> fdo::Result<String> {
        tracing::info!(user, image_path, replace, "enroll requested");
        self.engine
            .enroll(user, Path::new(image_path), replace)
            .await
            .map_err(|e| {
                tracing::warn!(user, error = %e, "enrollment failed");
                failed(e)
            })
    }

    /// Enable or disable authentication for an enrolled user.
    async fn set_user_active(&self, user: &str, active: bool) -> fdo::Result<bool> {
        tracing::info!(user, active, "set_user_active requested");
        self.engine.set_user_active(user, active).await.map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> String {
        self.engine.status().await.to_string()
    }

    #[zbus(signal)]
    async fn presence_changed(
        emitter: &SignalEmitter<'_>,
        state: &str,
        similarity: f64,
        absence_ms: u64,
        lock_requested: bool,
    ) -> zbus::Result<()>;
}

/// Re-publish guard updates as `PresenceChanged` signals until the guard goes away.
pub async fn forward_presence(conn: Connection, mut updates: broadcast::Receiver<PresenceUpdate>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot create signal emitter; presence signals disabled");
            return;
        }
    };

    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "presence signal forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let result = VigilService::presence_changed(
            &emitter,
            update.state.as_str(),
            update.similarity.map_or(f64::NAN, f64::from),
            update.absence_duration.map_or(0, |d| d.as_millis() as u64),
            update.lock_requested,
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to emit PresenceChanged");
        }
    }
}
