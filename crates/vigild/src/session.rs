use vigil_core::{LockReason, SessionLock};
use zbus::Connection;

#[zbus::proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1/session/auto"
)]
trait LoginSession {
    async fn lock(&self) -> zbus::Result<()>;
    async fn unlock(&self) -> zbus::Result<()>;
}

/// Locks the graphical session through systemd-logind on the system bus.
pub struct LogindSessionLock {
    proxy: LoginSessionProxy<'static>,
}

impl LogindSessionLock {
    pub async fn connect(session_path: &str) -> zbus::Result<Self> {
        let connection = Connection::system().await?;
        let proxy = LoginSessionProxy::builder(&connection)
            .path(session_path.to_string())?
            .build()
            .await?;
        tracing::info!(session = session_path, "logind session lock ready");
        Ok(Self { proxy })
    }
}

impl SessionLock for LogindSessionLock {
    type Error = zbus::Error;

    async fn lock(&self, reason: LockReason) -> zbus::Result<()> {
        tracing::warn!(%reason, "locking session");
        self.proxy.lock().await
    }

    async fn unlock(&self) -> zbus::Result<()> {
        tracing::info!("unlocking session");
        self.proxy.unlock().await
    }
}
