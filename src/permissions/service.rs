//! Permission decisions for tools, projects, and result sets.
//!
//! A check selects the applicable rule (first match by descending priority,
//! then the default rule) and evaluates it. A "no" is a value, never an
//! error: every check returns a [`PermissionCheckResult`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::audit::{AuditEntry, AuditSink, TracingAuditSink};
use super::cache::{CacheStats, DecisionCache};
use super::context::UserContext;
use super::rules::{CompiledRule, CompiledRules, PermissionConfig, PermissionRule, is_write_operation};
use crate::Result;
use crate::auth::Claims;

/// Replaces author/assignee when a rule hides sensitive data.
pub const REDACTED: &str = "[REDACTED]";

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheckResult {
    /// Whether access is granted
    pub allowed: bool,
    /// Why access was denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionCheckResult {
    /// A grant.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denial with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A project record as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project key
    pub key: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Remaining fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An issue record as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Issue key
    pub key: String,
    /// Owning project key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Severity (INFO..BLOCKER)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Workflow status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Author login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Assignee login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Remaining fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Evaluates permission rules for users.
pub struct PermissionService {
    config: PermissionConfig,
    rules: CompiledRules,
    cache: Option<DecisionCache>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl PermissionService {
    /// Compile `config` and build the service.
    ///
    /// When auditing is enabled and no sink is supplied, entries go to
    /// [`TracingAuditSink`].
    pub fn new(config: PermissionConfig, sink: Option<Arc<dyn AuditSink>>) -> Result<Self> {
        let rules = CompiledRules::compile(&config)?;
        let cache = config
            .enable_caching
            .then(|| DecisionCache::new(config.cache_ttl));
        let audit = config
            .enable_audit
            .then(|| sink.unwrap_or_else(|| Arc::new(TracingAuditSink)));

        debug!(
            rules = rules.len(),
            default_rule = rules.has_default(),
            caching = config.enable_caching,
            audit = config.enable_audit,
            "Permission rules compiled"
        );

        Ok(Self {
            config,
            rules,
            cache,
            audit,
        })
    }

    /// The configuration this service was built from.
    #[must_use]
    pub fn config(&self) -> &PermissionConfig {
        &self.config
    }

    /// Normalize validated claims into a [`UserContext`].
    #[must_use]
    pub fn extract_user_context(&self, claims: Arc<Claims>) -> UserContext {
        UserContext::from_claims(claims)
    }

    /// The rule that governs `user`, if any.
    #[must_use]
    pub fn applicable_rule(&self, user: &UserContext) -> Option<&PermissionRule> {
        self.rules.applicable(&user.groups).map(|r| &r.source)
    }

    /// Decide whether `user` may invoke `tool`.
    pub fn check_tool_access(&self, user: &UserContext, tool: &str) -> PermissionCheckResult {
        self.decide(user, "tool", tool, |rule| evaluate_tool(rule, tool))
    }

    /// Decide whether `user` may access the project `project_key`.
    pub fn check_project_access(&self, user: &UserContext, project_key: &str) -> PermissionCheckResult {
        self.decide(user, "project", project_key, |rule| {
            evaluate_project(rule, project_key)
        })
    }

    /// Keep only projects the user may see. Order is preserved.
    #[must_use]
    pub fn filter_projects(&self, user: &UserContext, projects: Vec<Project>) -> Vec<Project> {
        let Some(rule) = self.rules.applicable(&user.groups) else {
            return Vec::new();
        };
        let before = projects.len();
        let kept: Vec<Project> = projects
            .into_iter()
            .filter(|p| rule.allows_project(&p.key))
            .collect();

        debug!(user = %user.user_id, before, after = kept.len(), "Filtered projects");
        kept
    }

    /// Keep only issues the user may see, redacting people fields when the
    /// governing rule hides sensitive data.
    #[must_use]
    pub fn filter_issues(&self, user: &UserContext, issues: Vec<Issue>) -> Vec<Issue> {
        let Some(rule) = self.rules.applicable(&user.groups) else {
            return Vec::new();
        };
        let redact = rule.hides_sensitive_data();
        let before = issues.len();

        let kept: Vec<Issue> = issues
            .into_iter()
            .filter(|issue| {
                issue.project.as_deref().is_none_or(|p| rule.allows_project(p))
                    && rule.allows_severity(issue.severity.as_deref())
                    && rule.allows_status(issue.status.as_deref())
            })
            .map(|mut issue| {
                if redact {
                    if issue.author.is_some() {
                        issue.author = Some(REDACTED.to_string());
                    }
                    if issue.assignee.is_some() {
                        issue.assignee = Some(REDACTED.to_string());
                    }
                }
                issue
            })
            .collect();

        debug!(user = %user.user_id, before, after = kept.len(), redact, "Filtered issues");
        kept
    }

    /// Drop all cached decisions.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Decision cache statistics, when caching is enabled.
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(DecisionCache::stats)
    }

    fn decide(
        &self,
        user: &UserContext,
        kind: &'static str,
        target: &str,
        evaluate: impl FnOnce(Option<&CompiledRule>) -> PermissionCheckResult,
    ) -> PermissionCheckResult {
        let key = self
            .cache
            .as_ref()
            .map(|_| DecisionCache::key(&user.groups, kind, target));

        let cached = match (&self.cache, &key) {
            (Some(cache), Some(key)) => cache.get(key),
            _ => None,
        };

        let result = match cached {
            Some(hit) => hit,
            None => {
                let rule = self.rules.applicable(&user.groups);
                if let Some(rule) = rule {
                    debug!(
                        user = %user.user_id,
                        priority = rule.source.priority,
                        groups = ?rule.source.groups,
                        "Applicable permission rule"
                    );
                }
                let result = evaluate(rule);
                if let (Some(cache), Some(key)) = (&self.cache, key) {
                    cache.insert(key, result.clone());
                }
                result
            }
        };

        if !result.allowed {
            warn!(
                user = %user.user_id,
                kind,
                target,
                reason = result.reason.as_deref().unwrap_or_default(),
                "Permission denied"
            );
        }

        if let Some(sink) = &self.audit {
            sink.record(AuditEntry::new(
                &user.user_id,
                format!("{kind}:{target}"),
                result.allowed,
                result.reason.clone(),
            ));
        }

        result
    }
}

fn evaluate_tool(rule: Option<&CompiledRule>, tool: &str) -> PermissionCheckResult {
    let Some(rule) = rule else {
        return PermissionCheckResult::deny("No applicable permission rule found");
    };

    if rule.denies_tool(tool) {
        PermissionCheckResult::deny(format!("Tool '{tool}' is explicitly denied"))
    } else if !rule.allows_tool(tool) {
        PermissionCheckResult::deny(format!("Tool '{tool}' is not in allowed tools list"))
    } else if rule.source.readonly && is_write_operation(tool) {
        PermissionCheckResult::deny(format!(
            "Read-only users cannot use write operation '{tool}'"
        ))
    } else {
        PermissionCheckResult::allow()
    }
}

fn evaluate_project(rule: Option<&CompiledRule>, project_key: &str) -> PermissionCheckResult {
    let Some(rule) = rule else {
        return PermissionCheckResult::deny("No applicable permission rule found");
    };

    if rule.allows_project(project_key) {
        PermissionCheckResult::allow()
    } else {
        PermissionCheckResult::deny(format!(
            "Project '{project_key}' does not match any allowed patterns"
        ))
    }
}
