//! User to service account resolution with failover.
//!
//! Resolution picks a candidate by a first-match scan over priority-sorted
//! mapping rules, then validates a client for it. A failed account may hand
//! over to its `fallback_account_id`; every attempted id is tracked so a
//! fallback cycle ends the resolution instead of looping. Attempts are
//! strictly sequential.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::account::{MappingRuleConfig, ServiceAccountConfig};
use super::backend::{BackendClient, ClientFactory, CredentialStore};
use super::health::{AccountHealth, HealthRegistry};
use crate::auth::Claims;
use crate::config::ServiceAccountsConfig;
use crate::pattern::PatternMatcher;
use crate::permissions::groups_from_claims;
use crate::{Error, Result};

/// Service account resolution failures.
#[derive(Debug, Clone, Error)]
pub enum MappingError {
    /// No rule matched and no default account is configured
    #[error("No service account mapping for user '{subject}'")]
    NoMapping {
        /// Token subject
        subject: String,
    },

    /// A rule or fallback names an unknown account
    #[error("Service account '{0}' not found")]
    AccountNotFound(String),

    /// Neither the credential store nor the config holds a token
    #[error("No credential available for service account '{0}'")]
    NoCredential(String),

    /// The client could not be built
    #[error("Failed to create client for service account '{account}': {reason}")]
    ClientCreation {
        /// Account id
        account: String,
        /// Underlying error
        reason: String,
    },

    /// The client was built but failed its health check
    #[error("Health check failed for service account '{account}': {reason}")]
    HealthCheck {
        /// Account id
        account: String,
        /// Underlying error
        reason: String,
    },

    /// Client creation or health check did not finish in time
    #[error("Service account '{account}' timed out after {timeout:?}")]
    Timeout {
        /// Account id
        account: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// Every account of a failover chain failed
    #[error("All service accounts failed, no failover available (attempted: {})", .attempted.join(", "))]
    AllAccountsFailed {
        /// Account ids in attempt order
        attempted: Vec<String>,
    },
}

/// A validated client and the account it acts as.
#[derive(Clone)]
pub struct ResolvedClient {
    /// Backend client
    pub client: Arc<dyn BackendClient>,
    /// Account id
    pub service_account_id: String,
}

impl fmt::Debug for ResolvedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedClient")
            .field("service_account_id", &self.service_account_id)
            .field("base_url", &self.client.base_url())
            .finish()
    }
}

struct CompiledMappingRule {
    source: MappingRuleConfig,
    user: Option<PatternMatcher>,
    issuer: Option<PatternMatcher>,
}

impl CompiledMappingRule {
    fn compile(rule: &MappingRuleConfig, index: usize) -> Result<Self> {
        let compile = |pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(PatternMatcher::parse)
                .transpose()
                .map_err(|e| Error::Config(format!("service_accounts.rules[{index}]: {e}")))
        };
        Ok(Self {
            source: rule.clone(),
            user: compile(&rule.user_pattern)?,
            issuer: compile(&rule.issuer_pattern)?,
        })
    }

    fn matches(&self, claims: &Claims, scopes: &[&str], groups: &[String]) -> bool {
        self.user.as_ref().is_none_or(|p| p.matches(&claims.sub))
            && self.issuer.as_ref().is_none_or(|p| p.matches(&claims.iss))
            && self
                .source
                .required_scopes
                .iter()
                .all(|s| scopes.contains(&s.as_str()))
            && (self.source.required_groups.is_empty()
                || self.source.required_groups.iter().any(|g| groups.contains(g)))
    }
}

/// Resolves users to validated backend clients.
pub struct ServiceAccountMapper {
    accounts: HashMap<String, ServiceAccountConfig>,
    rules: Vec<CompiledMappingRule>,
    default_account: Option<String>,
    enable_failover: bool,
    timeout: Duration,
    health: HealthRegistry,
    factory: Arc<dyn ClientFactory>,
    credentials: Option<Arc<dyn CredentialStore>>,
}

impl ServiceAccountMapper {
    /// Build a mapper.
    ///
    /// Fails when a rule pattern does not compile or when a rule, the
    /// default account, or a fallback names an unknown account.
    pub fn new(
        config: &ServiceAccountsConfig,
        factory: Arc<dyn ClientFactory>,
        credentials: Option<Arc<dyn CredentialStore>>,
    ) -> Result<Self> {
        let accounts: HashMap<String, ServiceAccountConfig> = config
            .accounts
            .iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect();

        let known = |id: &str, what: &str| {
            if accounts.contains_key(id) {
                Ok(())
            } else {
                Err(Error::Config(format!("{what} references unknown service account '{id}'")))
            }
        };

        let mut rules = Vec::with_capacity(config.rules.len());
        for (i, rule) in config.rules.iter().enumerate() {
            known(&rule.service_account_id, &format!("service_accounts.rules[{i}]"))?;
            rules.push(CompiledMappingRule::compile(rule, i)?);
        }
        rules.sort_by(|a, b| b.source.priority.cmp(&a.source.priority));

        if let Some(id) = &config.default_account {
            known(id, "service_accounts.default_account")?;
        }
        for account in &config.accounts {
            if let Some(fallback) = &account.fallback_account_id {
                known(fallback, &format!("fallback of '{}'", account.id))?;
            }
        }

        let health = HealthRegistry::new(
            config.accounts.iter().map(|a| a.id.as_str()),
            config.failure_threshold,
        );

        info!(
            accounts = accounts.len(),
            rules = rules.len(),
            default_account = ?config.default_account,
            failover = config.enable_failover,
            "Service account mapper ready"
        );

        Ok(Self {
            accounts,
            rules,
            default_account: config.default_account.clone(),
            enable_failover: config.enable_failover,
            timeout: config.health_check.timeout,
            health,
            factory,
            credentials,
        })
    }

    /// Resolve a validated client for the user described by `claims`.
    ///
    /// With no fallback attempted, the primary account's own error is
    /// returned; when a failover chain was walked and every link failed,
    /// [`MappingError::AllAccountsFailed`].
    pub async fn get_client_for_user(&self, claims: &Claims) -> std::result::Result<ResolvedClient, MappingError> {
        let primary = self.select_account(claims).ok_or_else(|| MappingError::NoMapping {
            subject: claims.sub.clone(),
        })?;

        let mut attempted: Vec<String> = Vec::new();
        let mut first_error: Option<MappingError> = None;
        let mut current = primary;

        loop {
            attempted.push(current.clone());
            match self.validate_account(&current).await {
                Ok(client) => {
                    self.health.record_success(&current);
                    if attempted.len() > 1 {
                        info!(user = %claims.sub, account = %current, attempted = ?attempted, "Failed over to service account");
                    }
                    return Ok(ResolvedClient {
                        client,
                        service_account_id: current,
                    });
                }
                Err(e) => {
                    self.health.record_failure(&current, &e.to_string());
                    warn!(user = %claims.sub, account = %current, error = %e, "Service account attempt failed");
                    first_error.get_or_insert(e);
                }
            }

            if !self.enable_failover {
                break;
            }
            match self.next_fallback(&current, &attempted) {
                Some(next) => current = next,
                None => break,
            }
        }

        if attempted.len() > 1 {
            return Err(MappingError::AllAccountsFailed { attempted });
        }
        Err(first_error.unwrap_or(MappingError::AllAccountsFailed { attempted }))
    }

    /// Validate every account once and record the results.
    pub async fn probe_all(&self) {
        let probes = self.accounts.keys().map(|id| async move {
            match self.validate_account(id).await {
                Ok(_) => self.health.record_success(id),
                Err(e) => {
                    debug!(account = %id, error = %e, "Service account probe failed");
                    self.health.record_failure(id, &e.to_string());
                }
            }
        });
        futures::future::join_all(probes).await;
    }

    /// Force an account unhealthy. Returns `false` for unknown ids.
    pub fn mark_unhealthy(&self, account_id: &str, reason: &str) -> bool {
        if !self.accounts.contains_key(account_id) {
            return false;
        }
        self.health.mark_unhealthy(account_id, reason);
        true
    }

    /// Force an account healthy. Returns `false` for unknown ids.
    pub fn mark_healthy(&self, account_id: &str) -> bool {
        if !self.accounts.contains_key(account_id) {
            return false;
        }
        self.health.mark_healthy(account_id);
        true
    }

    /// Health record for one account.
    #[must_use]
    pub fn health(&self, account_id: &str) -> Option<AccountHealth> {
        self.health.get(account_id)
    }

    /// Health records for all accounts.
    #[must_use]
    pub fn health_snapshot(&self) -> Vec<AccountHealth> {
        self.health.snapshot()
    }

    /// Configured account ids, sorted.
    #[must_use]
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// First healthy account whose rule matches, else the default account.
    ///
    /// The default account is returned even when unhealthy; its attempt
    /// decides the outcome.
    fn select_account(&self, claims: &Claims) -> Option<String> {
        let scopes = claims.scopes();
        let groups = groups_from_claims(claims);

        for rule in &self.rules {
            if !rule.matches(claims, &scopes, &groups) {
                continue;
            }
            let id = &rule.source.service_account_id;
            if self.health.is_healthy(id) {
                debug!(user = %claims.sub, account = %id, priority = rule.source.priority, "Mapping rule matched");
                return Some(id.clone());
            }
            debug!(user = %claims.sub, account = %id, "Skipping unhealthy service account");
        }

        self.default_account.clone()
    }

    /// The next account to try after `current`, skipping unhealthy links
    /// and anything already attempted.
    fn next_fallback(&self, current: &str, attempted: &[String]) -> Option<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut next = self.accounts.get(current)?.fallback_account_id.as_deref();

        while let Some(id) = next {
            if attempted.iter().any(|a| a == id) || !seen.insert(id) {
                debug!(account = %current, fallback = %id, "Fallback already attempted");
                return None;
            }
            let account = self.accounts.get(id)?;
            if self.health.is_healthy(id) {
                return Some(id.to_string());
            }
            debug!(fallback = %id, "Skipping unhealthy fallback");
            next = account.fallback_account_id.as_deref();
        }
        None
    }

    async fn validate_account(&self, id: &str) -> std::result::Result<Arc<dyn BackendClient>, MappingError> {
        let account = self
            .accounts
            .get(id)
            .ok_or_else(|| MappingError::AccountNotFound(id.to_string()))?;
        let token = self.credential_for(account).await?;

        let timed_out = || MappingError::Timeout {
            account: id.to_string(),
            timeout: self.timeout,
        };

        let client = tokio::time::timeout(
            self.timeout,
            self.factory.create_client(
                &token,
                account.url_or_default(),
                account.organization.as_deref(),
            ),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(|e| MappingError::ClientCreation {
            account: id.to_string(),
            reason: e.to_string(),
        })?;

        tokio::time::timeout(self.timeout, client.ping())
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| MappingError::HealthCheck {
                account: id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(client)
    }

    async fn credential_for(&self, account: &ServiceAccountConfig) -> std::result::Result<String, MappingError> {
        if let Some(store) = &self.credentials {
            if store.has_credential(&account.id).await {
                if let Some(token) = store.get_credential(&account.id).await {
                    return Ok(token);
                }
            }
        }
        account
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| MappingError::NoCredential(account.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_accounts::{BackendError, StaticCredentialStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct FakeClient {
        url: String,
        ping_ok: bool,
    }

    #[async_trait]
    impl BackendClient for FakeClient {
        async fn ping(&self) -> std::result::Result<(), BackendError> {
            if self.ping_ok {
                Ok(())
            } else {
                Err(BackendError::Status(503))
            }
        }

        fn base_url(&self) -> &str {
            &self.url
        }
    }

    /// Fails creation for tokens starting with `bad`, fails pings for
    /// tokens starting with `down`, and logs every token it sees.
    #[derive(Default)]
    struct FakeFactory {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClientFactory for FakeFactory {
        async fn create_client(
            &self,
            token: &str,
            url: &str,
            _organization: Option<&str>,
        ) -> std::result::Result<Arc<dyn BackendClient>, BackendError> {
            self.seen.lock().push(token.to_string());
            if token.starts_with("bad") {
                return Err(BackendError::Config("rejected".to_string()));
            }
            Ok(Arc::new(FakeClient {
                url: url.to_string(),
                ping_ok: !token.starts_with("down"),
            }))
        }
    }

    fn account(id: &str, token: &str, fallback: Option<&str>) -> ServiceAccountConfig {
        ServiceAccountConfig {
            id: id.to_string(),
            token: Some(token.to_string()),
            fallback_account_id: fallback.map(str::to_string),
            ..ServiceAccountConfig::default()
        }
    }

    fn rule(account: &str, priority: i32) -> MappingRuleConfig {
        MappingRuleConfig {
            priority,
            service_account_id: account.to_string(),
            ..MappingRuleConfig::default()
        }
    }

    fn mapper(config: &ServiceAccountsConfig) -> (ServiceAccountMapper, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let mapper = ServiceAccountMapper::new(config, factory.clone(), None).unwrap();
        (mapper, factory)
    }

    fn user() -> Claims {
        Claims::new("alice", "https://idp.example.com")
    }

    #[tokio::test]
    async fn primary_failure_fails_over_to_fallback() {
        // GIVEN: primary creation always fails, fallback is healthy
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "bad-a", Some("b")), account("b", "good-b", None)],
            rules: vec![rule("a", 10)],
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        // WHEN: resolving
        let resolved = mapper.get_client_for_user(&user()).await.unwrap();

        // THEN: fallback's client, exactly one primary failure recorded
        assert_eq!(resolved.service_account_id, "b");
        assert_eq!(mapper.health("a").unwrap().consecutive_failures, 1);
        assert_eq!(mapper.health("b").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn fallback_cycle_terminates() {
        // GIVEN: a -> b -> a, both failing
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "bad-a", Some("b")), account("b", "down-b", Some("a"))],
            rules: vec![rule("a", 10)],
            ..ServiceAccountsConfig::default()
        };
        let (mapper, factory) = mapper(&config);

        // WHEN: resolving
        let err = mapper.get_client_for_user(&user()).await.unwrap_err();

        // THEN: each account tried once, generic chain failure
        assert!(err.to_string().contains("no failover available"));
        match err {
            MappingError::AllAccountsFailed { attempted } => assert_eq!(attempted, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(factory.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn primary_without_fallback_surfaces_its_own_error() {
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "down-a", None)],
            rules: vec![rule("a", 10)],
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        let err = mapper.get_client_for_user(&user()).await.unwrap_err();

        assert!(matches!(err, MappingError::HealthCheck { ref account, .. } if account == "a"));
    }

    #[tokio::test]
    async fn failover_disabled_stops_at_primary() {
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "bad-a", Some("b")), account("b", "good-b", None)],
            rules: vec![rule("a", 10)],
            enable_failover: false,
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        let err = mapper.get_client_for_user(&user()).await.unwrap_err();

        assert!(matches!(err, MappingError::ClientCreation { .. }));
    }

    #[tokio::test]
    async fn no_rule_and_no_default_is_no_mapping() {
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "good", None)],
            rules: vec![MappingRuleConfig {
                user_pattern: Some("svc-*".to_string()),
                ..rule("a", 10)
            }],
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        let err = mapper.get_client_for_user(&user()).await.unwrap_err();

        assert!(matches!(err, MappingError::NoMapping { ref subject } if subject == "alice"));
    }

    #[tokio::test]
    async fn rules_match_scopes_groups_and_patterns_by_priority() {
        // GIVEN: an admin-scope rule above a group rule above a default
        let config = ServiceAccountsConfig {
            accounts: vec![
                account("admin", "good-admin", None),
                account("team", "good-team", None),
                account("fallback", "good-default", None),
            ],
            rules: vec![
                MappingRuleConfig {
                    required_groups: vec!["team-a".to_string()],
                    issuer_pattern: Some("https://idp.example.com".to_string()),
                    ..rule("team", 50)
                },
                MappingRuleConfig {
                    required_scopes: vec!["sonarqube:admin".to_string()],
                    ..rule("admin", 100)
                },
            ],
            default_account: Some("fallback".to_string()),
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        let mut admin = user();
        admin.scope = Some("sonarqube:admin".to_string());
        let mut member = user();
        member.groups = Some(json!(["team-a"]));

        // THEN: each user lands on the right account
        let id = |r: ResolvedClient| r.service_account_id;
        assert_eq!(id(mapper.get_client_for_user(&admin).await.unwrap()), "admin");
        assert_eq!(id(mapper.get_client_for_user(&member).await.unwrap()), "team");
        assert_eq!(id(mapper.get_client_for_user(&user()).await.unwrap()), "fallback");
    }

    #[tokio::test]
    async fn unhealthy_candidates_are_skipped() {
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "good-a", None), account("b", "good-b", None)],
            rules: vec![rule("a", 100), rule("b", 50)],
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        assert!(mapper.mark_unhealthy("a", "maintenance"));
        let resolved = mapper.get_client_for_user(&user()).await.unwrap();
        assert_eq!(resolved.service_account_id, "b");

        assert!(mapper.mark_healthy("a"));
        let resolved = mapper.get_client_for_user(&user()).await.unwrap();
        assert_eq!(resolved.service_account_id, "a");
        assert!(!mapper.mark_healthy("ghost"));
    }

    #[tokio::test]
    async fn credential_store_wins_over_inline_token() {
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "bad-inline", None)],
            rules: vec![rule("a", 1)],
            ..ServiceAccountsConfig::default()
        };
        let factory = Arc::new(FakeFactory::default());
        let store = Arc::new(StaticCredentialStore::new([(
            "a".to_string(),
            "good-from-store".to_string(),
        )]));
        let mapper = ServiceAccountMapper::new(&config, factory.clone(), Some(store)).unwrap();

        let resolved = mapper.get_client_for_user(&user()).await.unwrap();

        assert_eq!(resolved.service_account_id, "a");
        assert_eq!(*factory.seen.lock(), vec!["good-from-store"]);
    }

    #[tokio::test]
    async fn missing_credential_is_reported() {
        let config = ServiceAccountsConfig {
            accounts: vec![ServiceAccountConfig {
                id: "a".to_string(),
                ..ServiceAccountConfig::default()
            }],
            rules: vec![rule("a", 1)],
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        let err = mapper.get_client_for_user(&user()).await.unwrap_err();

        assert!(matches!(err, MappingError::NoCredential(ref id) if id == "a"));
    }

    #[tokio::test]
    async fn probes_flip_accounts_after_threshold() {
        let config = ServiceAccountsConfig {
            accounts: vec![account("a", "down-a", None), account("b", "good-b", None)],
            failure_threshold: 2,
            ..ServiceAccountsConfig::default()
        };
        let (mapper, _) = mapper(&config);

        mapper.probe_all().await;
        assert!(mapper.health("a").unwrap().healthy);
        mapper.probe_all().await;

        assert!(!mapper.health("a").unwrap().healthy);
        assert!(mapper.health("b").unwrap().healthy);
    }

    #[test]
    fn unknown_references_are_rejected() {
        let factory: Arc<dyn ClientFactory> = Arc::new(FakeFactory::default());
        let dangling_rule = ServiceAccountsConfig {
            accounts: vec![account("a", "t", None)],
            rules: vec![rule("missing", 1)],
            ..ServiceAccountsConfig::default()
        };
        let dangling_fallback = ServiceAccountsConfig {
            accounts: vec![account("a", "t", Some("missing"))],
            ..ServiceAccountsConfig::default()
        };

        assert!(ServiceAccountMapper::new(&dangling_rule, factory.clone(), None).is_err());
        assert!(ServiceAccountMapper::new(&dangling_fallback, factory, None).is_err());
    }
}
