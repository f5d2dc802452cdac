use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vigil_core::{MasterSecret, PresenceConfig, DEFAULT_AUTH_THRESHOLD};
use vigil_ipc::ClientConfig;

/// Placeholder secret, accepted only with `VIGIL_DEV_MODE=1`.
const DEV_MASTER_SECRET: &str = "vigil-development-master-secret";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("VIGIL_MASTER_SECRET is not set (set VIGIL_DEV_MODE=1 to use a development placeholder)")]
    MissingMasterSecret,
    #[error("VIGIL_MASTER_SECRET is empty")]
    EmptyMasterSecret,
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    pub master_secret: MasterSecret,
    /// Whether the development placeholder secret is in use.
    pub dev_mode: bool,
    /// Detection engine socket and timeouts.
    pub client: ClientConfig,
    /// JSON template store file.
    pub store_path: PathBuf,
    /// Latest camera frame written by the capture helper.
    pub frame_path: PathBuf,
    /// Optional JSONL audit file; audit goes to tracing when unset.
    pub audit_log: Option<PathBuf>,
    /// Cosine similarity threshold for authentication.
    pub auth_threshold: f32,
    pub presence: PresenceConfig,
    /// Minimum engine quality score accepted at enrollment.
    pub min_enroll_quality: f32,
    /// logind session object to lock.
    pub login_session_path: String,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let dev_mode = var("VIGIL_DEV_MODE").is_some_and(|v| v == "1");
        let master_secret = match var("VIGIL_MASTER_SECRET") {
            Some(s) => MasterSecret::new(s).map_err(|_| ConfigError::EmptyMasterSecret)?,
            None if dev_mode => {
                tracing::warn!("VIGIL_DEV_MODE=1: using the placeholder master secret; templates are NOT protected");
                MasterSecret::new(DEV_MASTER_SECRET).map_err(|_| ConfigError::EmptyMasterSecret)?
            }
            None => return Err(ConfigError::MissingMasterSecret),
        };

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("vigil");

        let defaults = ClientConfig::default();
        let client = ClientConfig {
            socket_path: var("VIGIL_DETECTOR_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_path),
            connect_timeout: millis(&var, "VIGIL_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            request_timeout: millis(&var, "VIGIL_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            ping_timeout: millis(&var, "VIGIL_PING_TIMEOUT_MS", defaults.ping_timeout),
        };

        let presence_defaults = PresenceConfig::default();
        let presence = PresenceConfig {
            poll_interval: nonzero_millis(&var, "VIGIL_POLL_INTERVAL_MS", presence_defaults.poll_interval),
            absence_timeout: millis(&var, "VIGIL_ABSENCE_TIMEOUT_MS", presence_defaults.absence_timeout),
            match_threshold: parsed(&var, "VIGIL_PRESENCE_THRESHOLD", presence_defaults.match_threshold),
            frame_max_age: millis(&var, "VIGIL_FRAME_MAX_AGE_MS", presence_defaults.frame_max_age),
        };

        Ok(Self {
            master_secret,
            dev_mode,
            client,
            store_path: var("VIGIL_TEMPLATE_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("templates.json")),
            frame_path: var("VIGIL_FRAME_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/run/vigil/frame.jpg")),
            audit_log: var("VIGIL_AUDIT_LOG").map(PathBuf::from),
            auth_threshold: parsed(&var, "VIGIL_AUTH_THRESHOLD", DEFAULT_AUTH_THRESHOLD),
            presence,
            min_enroll_quality: parsed(&var, "VIGIL_MIN_ENROLL_QUALITY", 0.4),
            login_session_path: var("VIGIL_LOGIN_SESSION_PATH")
                .unwrap_or_else(|| "/org/freedesktop/login1/session/auto".to_string()),
            bus: match var("VIGIL_BUS").as_deref() {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        })
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    var(key)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Like [`millis`], but zero counts as malformed.
fn nonzero_millis(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let value = millis(var, key, default);
    if value.is_zero() {
        tracing::warn!(key, default_ms = default.as_millis() as u64, "zero is not a valid interval; using default");
        return default;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn missing_secret_fails_fast() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingMasterSecret)));
    }

    #[test]
    fn empty_secret_rejected_even_in_dev_mode() {
        let result = load(&[("VIGIL_MASTER_SECRET", ""), ("VIGIL_DEV_MODE", "1")]);
        assert!(matches!(result, Err(ConfigError::EmptyMasterSecret)));
    }

    #[test]
    fn dev_mode_uses_placeholder() {
        let config = load(&[("VIGIL_DEV_MODE", "1")]).unwrap();
        assert!(config.dev_mode);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = load(&[("VIGIL_MASTER_SECRET", "s3cret"), ("HOME", "/home/ada")]).unwrap();
        assert_eq!(config.auth_threshold, 0.6);
        assert_eq!(config.presence.match_threshold, 0.5);
        assert_eq!(config.presence.poll_interval, Duration::from_millis(200));
        assert_eq!(config.presence.absence_timeout, Duration::from_secs(5));
        assert_eq!(config.client.connect_timeout, Duration::from_millis(2000));
        assert_eq!(config.client.ping_timeout, Duration::from_millis(500));
        assert_eq!(config.store_path, PathBuf::from("/home/ada/.local/share/vigil/templates.json"));
        assert_eq!(config.bus, BusKind::Session);
        assert!(config.audit_log.is_none());
    }

    #[test]
    fn overrides_and_malformed_values() {
        let config = load(&[
            ("VIGIL_MASTER_SECRET", "s3cret"),
            ("VIGIL_ABSENCE_TIMEOUT_MS", "8000"),
            ("VIGIL_AUTH_THRESHOLD", "not-a-number"),
            ("VIGIL_DETECTOR_SOCKET", "/tmp/engine.sock"),
            ("VIGIL_BUS", "system"),
        ])
        .unwrap();
        assert_eq!(config.presence.absence_timeout, Duration::from_secs(8));
        assert_eq!(config.auth_threshold, 0.6);
        assert_eq!(config.client.socket_path, PathBuf::from("/tmp/engine.sock"));
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn zero_poll_interval_falls_back_to_default() {
        let config = load(&[("VIGIL_MASTER_SECRET", "s3cret"), ("VIGIL_POLL_INTERVAL_MS", "0")]).unwrap();
        assert_eq!(config.presence.poll_interval, Duration::from_millis(200));

        let config = load(&[("VIGIL_MASTER_SECRET", "s3cret"), ("VIGIL_POLL_INTERVAL_MS", "50")]).unwrap();
        assert_eq!(config.presence.poll_interval, Duration::from_millis(50));
    }
}
