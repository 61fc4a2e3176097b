//! Audit trail for backup operations.
//!
//! Audit writes are best-effort: [`BestEffortAudit`] is the single place where
//! a failing sink is logged and dropped, so backup and restore code never has
//! to handle audit errors itself.

use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::sync::Arc;

pub static BACKUP_CREATE: &str = "BACKUP_CREATE";
pub static BACKUP_DELETE: &str = "BACKUP_DELETE";
pub static BACKUP_RESTORE: &str = "BACKUP_RESTORE";
pub static BACKUP_AUTO_CREATE: &str = "BACKUP_AUTO_CREATE";
pub static SCHEDULE_CREATE: &str = "BACKUP_SCHEDULE_CREATE";
pub static SCHEDULE_UPDATE: &str = "BACKUP_SCHEDULE_UPDATE";
pub static SCHEDULE_DELETE: &str = "BACKUP_SCHEDULE_DELETE";

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder, Getters)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub")]
pub struct AuditEvent {
    #[builder(into)]
    action: String,
    #[builder(into)]
    resource: String,
    #[builder(into)]
    user_id: Option<String>,
    success: bool,
    #[builder(default = Value::Null)]
    details: Value,
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Sink that only emits a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        tracing::info!(
            action = %event.action,
            resource = %event.resource,
            user = ?event.user_id,
            success = event.success,
            details = %event.details,
            "audit"
        );
        Ok(())
    }
}

/// Failure boundary around an [`AuditSink`].
#[derive(Clone)]
pub struct BestEffortAudit {
    sink: Arc<dyn AuditSink>,
}

impl BestEffortAudit {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.sink.record(&event) {
            tracing::warn!(
                "Dropping audit event {} on {}: {e}",
                event.action,
                event.resource
            );
        }
    }
}

impl Default for BestEffortAudit {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::result_error::error::Error;
    use std::sync::Mutex;

    /// Sink that keeps events in memory.
    #[derive(Default)]
    pub(crate) struct MemoryAuditSink {
        pub events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditSink for MemoryAuditSink {
        fn record(&self, event: &AuditEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    pub(crate) struct FailingAuditSink;

    impl AuditSink for FailingAuditSink {
        fn record(&self, _event: &AuditEvent) -> Result<()> {
            Err(Error::from(std::io::Error::other("audit store down")))
        }
    }

    #[test]
    fn test_builder_defaults() {
        let event = AuditEvent::builder()
            .action(BACKUP_CREATE)
            .resource("backup")
            .success(true)
            .build();
        assert_eq!(event.details(), &Value::Null);
        assert!(event.user_id().is_none());
    }

    #[test]
    fn test_best_effort_swallows_failure() {
        let audit = BestEffortAudit::new(Arc::new(FailingAuditSink));
        audit.record(
            AuditEvent::builder()
                .action(BACKUP_DELETE)
                .resource("backup")
                .success(false)
                .build(),
        );
    }

    #[test]
    fn test_best_effort_forwards_events() {
        let sink = Arc::new(MemoryAuditSink::default());
        let audit = BestEffortAudit::new(sink.clone());
        audit.record(
            AuditEvent::builder()
                .action(BACKUP_AUTO_CREATE)
                .resource("backup_schedule")
                .success(true)
                .details(serde_json::json!({ "scheduleId": "s1" }))
                .build(),
        );
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details()["scheduleId"], "s1");
    }
}
