//! Permission rule tables.
//!
//! Rules are written in configuration, validated and compiled once, and
//! evaluated in descending `priority` order (ties keep declaration order).
//! `allowed_projects` entries are regular expressions matched anywhere in the
//! project key; anchor them (`^...$`) for whole-key matches. Tool lists accept
//! exact names and globs (`*`, `measures_*`).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pattern::{PatternMatcher, any_matches, compile_all};
use crate::{Error, Result};

/// Tools that modify state on the backend.
pub const WRITE_OPERATIONS: &[&str] = &[
    "markIssueFalsePositive",
    "markIssueWontFix",
    "markIssuesFalsePositive",
    "markIssuesWontFix",
    "addCommentToIssue",
    "assignIssue",
    "confirmIssue",
    "unconfirmIssue",
    "resolveIssue",
    "reopenIssue",
    "update_hotspot_status",
];

/// Returns `true` if `tool` mutates backend state.
#[must_use]
pub fn is_write_operation(tool: &str) -> bool {
    WRITE_OPERATIONS.contains(&tool)
}

/// Issue severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// INFO
    Info,
    /// MINOR
    Minor,
    /// MAJOR
    Major,
    /// CRITICAL
    Critical,
    /// BLOCKER
    Blocker,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Self::Info),
            "MINOR" => Ok(Self::Minor),
            "MAJOR" => Ok(Self::Major),
            "CRITICAL" => Ok(Self::Critical),
            "BLOCKER" => Ok(Self::Blocker),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Minor => "MINOR",
            Self::Major => "MAJOR",
            Self::Critical => "CRITICAL",
            Self::Blocker => "BLOCKER",
        };
        f.write_str(s)
    }
}

/// One permission rule as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Groups this rule applies to (absent = everyone)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    /// Project key patterns (regex)
    pub allowed_projects: Vec<String>,
    /// Allowed tools (names or globs)
    pub allowed_tools: Vec<String>,
    /// Denied tools; wins over `allowed_tools`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_tools: Option<Vec<String>>,
    /// Forbid write operations
    pub readonly: bool,
    /// Highest issue severity visible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_severity: Option<Severity>,
    /// Issue statuses visible (absent = all)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_statuses: Option<Vec<String>>,
    /// Redact author/assignee in issue results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_sensitive_data: Option<bool>,
    /// Evaluation priority (higher first)
    #[serde(default)]
    pub priority: i32,
}

/// Permission configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Rules, evaluated by descending priority
    pub rules: Vec<PermissionRule>,
    /// Rule applied when no rule's groups match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_rule: Option<PermissionRule>,
    /// Cache decisions per (user, groups, tool|project)
    pub enable_caching: bool,
    /// Decision cache TTL
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Emit an audit entry per check
    pub enable_audit: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_rule: None,
            enable_caching: true,
            cache_ttl: Duration::from_secs(300),
            enable_audit: false,
        }
    }
}

impl PermissionConfig {
    /// Validate the configuration by compiling it.
    pub fn validate(&self) -> Result<()> {
        CompiledRules::compile(self).map(|_| ())
    }
}

/// A rule with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// The rule as configured
    pub source: PermissionRule,
    projects: Vec<PatternMatcher>,
    tools: Vec<PatternMatcher>,
    denied: Vec<PatternMatcher>,
}

impl CompiledRule {
    fn compile(rule: &PermissionRule, label: &str) -> Result<Self> {
        let projects = compile_all(&rule.allowed_projects, PatternMatcher::regex)
            .map_err(|e| Error::Config(format!("{label}: {e}")))?;
        let tools = compile_all(&rule.allowed_tools, PatternMatcher::glob)
            .map_err(|e| Error::Config(format!("{label}: {e}")))?;
        let denied = compile_all(rule.denied_tools.as_deref().unwrap_or_default(), PatternMatcher::glob)
            .map_err(|e| Error::Config(format!("{label}: {e}")))?;

        Ok(Self {
            source: rule.clone(),
            projects,
            tools,
            denied,
        })
    }

    /// Returns `true` if the rule applies to a user with these groups.
    #[must_use]
    pub fn applies_to(&self, groups: &[String]) -> bool {
        match &self.source.groups {
            None => true,
            Some(rule_groups) => rule_groups.iter().any(|g| groups.contains(g)),
        }
    }

    /// Returns `true` if `project_key` matches an allowed project pattern.
    #[must_use]
    pub fn allows_project(&self, project_key: &str) -> bool {
        any_matches(&self.projects, project_key)
    }

    /// Returns `true` if `tool` is on the deny list.
    #[must_use]
    pub fn denies_tool(&self, tool: &str) -> bool {
        any_matches(&self.denied, tool)
    }

    /// Returns `true` if `tool` is on the allow list.
    #[must_use]
    pub fn allows_tool(&self, tool: &str) -> bool {
        any_matches(&self.tools, tool)
    }

    /// Returns `true` if an issue with this severity is visible.
    ///
    /// Severities outside the known scale are not ranked and stay visible.
    #[must_use]
    pub fn allows_severity(&self, severity: Option<&str>) -> bool {
        let (Some(max), Some(raw)) = (self.source.max_severity, severity) else {
            return true;
        };
        raw.parse::<Severity>().map_or(true, |s| s <= max)
    }

    /// Returns `true` if an issue with this status is visible.
    #[must_use]
    pub fn allows_status(&self, status: Option<&str>) -> bool {
        match (&self.source.allowed_statuses, status) {
            (None, _) => true,
            (Some(allowed), Some(status)) => allowed.iter().any(|a| a.eq_ignore_ascii_case(status)),
            (Some(_), None) => false,
        }
    }

    /// Returns `true` if author/assignee must be redacted.
    #[must_use]
    pub fn hides_sensitive_data(&self) -> bool {
        self.source.hide_sensitive_data.unwrap_or(false)
    }
}

/// A complete compiled rule table.
#[derive(Debug, Clone)]
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
    default_rule: Option<CompiledRule>,
}

impl CompiledRules {
    /// Compile and priority-sort a permission configuration.
    ///
    /// Fails on the first invalid pattern, or when the table has neither
    /// rules nor a default.
    pub fn compile(config: &PermissionConfig) -> Result<Self> {
        if config.rules.is_empty() && config.default_rule.is_none() {
            return Err(Error::Config(
                "permissions: at least one rule or a default_rule is required".to_string(),
            ));
        }

        let mut rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| CompiledRule::compile(r, &format!("permissions.rules[{i}]")))
            .collect::<Result<Vec<_>>>()?;
        // Stable sort: equal priorities keep declaration order
        rules.sort_by(|a, b| b.source.priority.cmp(&a.source.priority));

        let default_rule = config
            .default_rule
            .as_ref()
            .map(|r| CompiledRule::compile(r, "permissions.default_rule"))
            .transpose()?;

        Ok(Self { rules, default_rule })
    }

    /// The first rule applicable to `groups`, or the default rule.
    #[must_use]
    pub fn applicable(&self, groups: &[String]) -> Option<&CompiledRule> {
        self.rules
            .iter()
            .find(|r| r.applies_to(groups))
            .or(self.default_rule.as_ref())
    }

    /// Number of non-default rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if only the default rule exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns `true` if a default rule is configured.
    #[must_use]
    pub fn has_default(&self) -> bool {
        self.default_rule.is_some()
    }
}
