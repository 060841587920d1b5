//! Audit trail for permission decisions.
//!
//! One [`AuditEntry`] is produced per check when auditing is enabled. Sinks
//! are fire-and-forget: recording never fails and never blocks a decision.
//!
//! # Actions
//!
//! | Action | When |
//! |--------|------|
//! | `tool:<name>` | A tool access check |
//! | `project:<key>` | A project access check |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Subject the decision was made for
    pub user_id: String,
    /// What was checked (`tool:<name>` or `project:<key>`)
    pub action: String,
    /// Decision
    pub allowed: bool,
    /// Denial reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Construct an entry stamped with the current time.
    #[must_use]
    pub fn new(user_id: &str, action: String, allowed: bool, reason: Option<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            action,
            allowed,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Record one entry.
    fn record(&self, entry: AuditEntry);
}

/// Emits each entry as a structured `tracing` event at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        match serde_json::to_string(&entry) {
            Ok(json) => tracing::info!(
                audit = %json,
                user = %entry.user_id,
                action = %entry.action,
                allowed = entry.allowed,
                "permission.decision"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize audit entry"),
        }
    }
}

/// Keeps entries in memory; used by tests and the `authorize` command.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}
