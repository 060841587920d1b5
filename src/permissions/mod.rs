//! Permission rules and decisions.
//!
//! Rules are evaluated first-match by descending priority; the optional
//! default rule applies when no rule's groups match; with neither, access is
//! denied. Decisions may be cached and audited.

mod audit;
mod cache;
mod context;
mod rules;
mod service;

pub use audit::{AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use cache::CacheStats;
pub use context::{UserContext, groups_from_claims};
pub use rules::{
    PermissionConfig, PermissionRule, Severity, WRITE_OPERATIONS, is_write_operation,
};
pub use service::{Issue, PermissionCheckResult, PermissionService, Project, REDACTED};
