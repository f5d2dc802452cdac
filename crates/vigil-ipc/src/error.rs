use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("cannot reach detection engine at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode request: {0}")]
    Encode(serde_json::Error),
    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("engine error: {0}")]
    Remote(String),
    #[error("malformed engine response: {0}")]
    InvalidResponse(String),
}

impl IpcError {
    /// Whether the connection can no longer be trusted to be in sync.
    pub fn poisons_connection(&self) -> bool {
        !matches!(self, IpcError::Remote(_) | IpcError::Encode(_))
    }
}
