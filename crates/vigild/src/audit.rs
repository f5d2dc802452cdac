use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use vigil_core::{AuditEvent, AuditSink, TracingAuditSink};

/// Appends one JSON object per audit event to a file.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn log_event(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Pick the configured sink: a JSONL file when a path is set, tracing otherwise.
pub fn open_sink(path: Option<&Path>) -> std::io::Result<Arc<dyn AuditSink>> {
    match path {
        Some(path) => {
            let sink = JsonlAuditSink::open(path)?;
            tracing::info!(path = %sink.path().display(), "audit log opened");
            Ok(Arc::new(sink))
        }
        None => {
            tracing::info!("no VIGIL_AUDIT_LOG configured; auditing to the tracing stream");
            Ok(Arc::new(TracingAuditSink))
        }
    }
}
