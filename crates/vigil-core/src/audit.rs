//! Best-effort audit trail for authentication and lock decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Authentication,
    SessionLock,
    SessionUnlock,
    Enrollment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub user_id: Option<String>,
    pub result: AuditResult,
    pub confidence: Option<f32>,
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            user_id: None,
            result,
            confidence: None,
            reason: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// External audit log. Implementations may fail; callers go through
/// [`record`], which never lets a failure escape.
pub trait AuditSink: Send + Sync {
    fn log_event(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Deliver an event, swallowing and logging sink failures.
pub fn record(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.log_event(&event) {
        tracing::warn!(
            error = %e,
            event_type = ?event.event_type,
            "audit sink rejected event; continuing"
        );
    }
}

/// Writes audit events into the tracing stream under the `vigil::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_event(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            target: "vigil::audit",
            event_type = ?event.event_type,
            user = event.user_id.as_deref().unwrap_or("-"),
            result = ?event.result,
            confidence = event.confidence,
            reason = event.reason.as_deref(),
            "audit"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures events; optionally fails every call after capturing.
    #[derive(Default)]
    pub struct MemorySink {
        pub events: Mutex<Vec<AuditEvent>>,
        pub fail: bool,
    }

    impl AuditSink for MemorySink {
        fn log_event(&self, event: &AuditEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                return Err("audit backend offline".into());
            }
            Ok(())
        }
    }
}
