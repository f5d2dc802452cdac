use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vigil_core::TemplateCipher;
use vigil_ipc::DetectionClient;

mod audit;
mod config;
mod dbus_interface;
mod engine;
mod frames;
mod session;
mod store;

use config::{BusKind, Config};
use dbus_interface::{VigilService, BUS_NAME, OBJECT_PATH};
use engine::{Engine, EngineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::from_env()?;
    let audit = audit::open_sink(config.audit_log.as_deref()).context("opening audit log")?;

    let client = Arc::new(DetectionClient::new(config.client.clone()));
    match client.ping().await {
        Ok(rtt) => tracing::info!(
            socket = %config.client.socket_path.display(),
            rtt_ms = rtt.as_millis() as u64,
            "detection engine reachable"
        ),
        Err(e) => tracing::warn!(
            socket = %config.client.socket_path.display(),
            error = %e,
            "detection engine not reachable yet; will retry on demand"
        ),
    }

    let lock = Arc::new(
        session::LogindSessionLock::connect(&config.login_session_path)
            .await
            .context("connecting to systemd-logind")?,
    );
    let frames = Arc::new(frames::SnapshotFrameSource::new(&config.frame_path));
    let store = Arc::new(store::FileTemplateStore::new(&config.store_path));
    tracing::info!(
        store = %store.path().display(),
        frames = %frames.path().display(),
        dev_mode = config.dev_mode,
        "collaborators ready"
    );

    let settings = EngineSettings {
        auth_threshold: config.auth_threshold,
        presence: config.presence.clone(),
        min_enroll_quality: config.min_enroll_quality,
    };
    let bus = config.bus;
    let cipher = Arc::new(TemplateCipher::new(config.master_secret));
    let engine = Arc::new(Engine::new(client, frames, lock, store, cipher, audit, settings));

    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VigilService::new(Arc::clone(&engine)))?
        .build()
        .await
        .context("registering on D-Bus")?;

    let forwarder = tokio::spawn(dbus_interface::forward_presence(conn.clone(), engine.subscribe()));

    tracing::info!(bus = ?bus, name = BUS_NAME, "vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    engine.stop_monitoring().await;
    forwarder.abort();
    Ok(())
}
