//! Composition root.
//!
//! [`AuthGateway`] owns one instance of every component and runs the
//! token -> claims -> permission/credential -> session pipeline. Nothing is
//! global: collaborators are injected through [`Collaborators`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::auth::{ExternalIdpManager, HttpJwksFetcher, IdpHealth, JwksFetcher, TokenValidator};
use crate::config::{Config, IdpConfig};
use crate::permissions::{
    AuditSink, CacheStats, Issue, PermissionCheckResult, PermissionService, Project, UserContext,
};
use crate::service_accounts::{
    AccountHealth, ClientFactory, CredentialStore, HttpClientFactory, ServiceAccountHealthMonitor,
    ServiceAccountMapper,
};
use crate::session::{SessionManager, SessionStats, UserSession};
use crate::{Error, Result};

/// External capabilities the gateway depends on.
pub struct Collaborators {
    /// JWKS source
    pub jwks_fetcher: Arc<dyn JwksFetcher>,
    /// Backend client builder
    pub client_factory: Arc<dyn ClientFactory>,
    /// Credential store consulted before inline tokens
    pub credential_store: Option<Arc<dyn CredentialStore>>,
    /// Audit destination (default: tracing)
    pub audit_sink: Option<Arc<dyn AuditSink>>,
}

impl Collaborators {
    /// HTTP-backed collaborators with timeouts from `config`.
    #[must_use]
    pub fn http(config: &Config) -> Self {
        Self {
            jwks_fetcher: Arc::new(HttpJwksFetcher::new(config.idp_health.timeout)),
            client_factory: Arc::new(HttpClientFactory::new(config.service_accounts.health_check.timeout)),
            credential_store: None,
            audit_sink: None,
        }
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedSession {
    /// Session id for subsequent calls
    pub session_id: String,
    /// Normalized user
    pub user: UserContext,
    /// Service account bound to the session
    pub service_account_id: String,
}

/// Health of every component.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    /// Per-issuer key fetch health
    pub identity_providers: Vec<IdpHealth>,
    /// Per-account health
    pub service_accounts: Vec<AccountHealth>,
    /// Session counters
    pub sessions: SessionStats,
    /// Permission decision cache, when enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_cache: Option<CacheStats>,
}

/// The authentication, authorization and credential-routing pipeline.
pub struct AuthGateway {
    validator: TokenValidator,
    idps: Arc<ExternalIdpManager>,
    permissions: PermissionService,
    mapper: Arc<ServiceAccountMapper>,
    monitor: ServiceAccountHealthMonitor,
    account_health_checks: bool,
    sessions: Arc<SessionManager>,
}

impl AuthGateway {
    /// Build every component from `config`.
    ///
    /// Every rule table is compiled here; a bad pattern or dangling account
    /// reference fails construction. Allow-listed issuers without an
    /// identity provider entry or static key are registered as generic
    /// providers.
    pub fn from_config(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let idps = Arc::new(ExternalIdpManager::new(
            collaborators.jwks_fetcher,
            &config.idp_health,
            config.auth.key_cache_ttl,
        ));
        for idp in &config.identity_providers {
            idps.add_idp(idp)?;
        }
        for issuer in &config.auth.issuers {
            let has_static_key = config.auth.static_keys.iter().any(|k| &k.issuer == issuer);
            if !has_static_key && !idps.has_idp(issuer) {
                debug!(issuer = %issuer, "Registering allow-listed issuer as generic provider");
                idps.add_idp(&IdpConfig {
                    issuer: issuer.clone(),
                    ..IdpConfig::default()
                })?;
            }
        }

        let validator = TokenValidator::new(config.auth.clone(), Arc::clone(&idps))?;
        let permissions = PermissionService::new(config.permissions.clone(), collaborators.audit_sink)?;
        let mapper = Arc::new(ServiceAccountMapper::new(
            &config.service_accounts,
            collaborators.client_factory,
            collaborators.credential_store,
        )?);

        info!(
            issuers = idps.issuers().len(),
            accounts = mapper.account_ids().len(),
            max_sessions = config.sessions.max_sessions,
            "Auth gateway ready"
        );

        Ok(Self {
            validator,
            idps,
            permissions,
            mapper,
            monitor: ServiceAccountHealthMonitor::new(config.service_accounts.health_check.interval),
            account_health_checks: config.service_accounts.health_check.enabled,
            sessions: Arc::new(SessionManager::new(&config.sessions)),
        })
    }

    /// Validate `token`, resolve a service account, and open a session.
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedSession> {
        let claims = Arc::new(self.validator.validate_token(token).await?);
        let user = self.permissions.extract_user_context(Arc::clone(&claims));
        let resolved = self.mapper.get_client_for_user(&claims).await?;

        let session_id = self.sessions.create_session(
            claims,
            resolved.client,
            Some(resolved.service_account_id.clone()),
        );
        info!(
            user = %user.user_id,
            issuer = %user.issuer,
            account = %resolved.service_account_id,
            "Authenticated"
        );

        Ok(AuthenticatedSession {
            session_id,
            user,
            service_account_id: resolved.service_account_id,
        })
    }

    /// Look up a live session.
    pub fn resume(&self, session_id: &str) -> Result<UserSession> {
        self.sessions
            .get_session(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Decide whether the session's user may invoke `tool`.
    pub fn authorize_tool(&self, session_id: &str, tool: &str) -> Result<PermissionCheckResult> {
        let user = self.user_for(session_id)?;
        Ok(self.permissions.check_tool_access(&user, tool))
    }

    /// Decide whether the session's user may access `project_key`.
    pub fn authorize_project(&self, session_id: &str, project_key: &str) -> Result<PermissionCheckResult> {
        let user = self.user_for(session_id)?;
        Ok(self.permissions.check_project_access(&user, project_key))
    }

    /// Filter a project listing for the session's user.
    pub fn filter_projects(&self, session_id: &str, projects: Vec<Project>) -> Result<Vec<Project>> {
        let user = self.user_for(session_id)?;
        Ok(self.permissions.filter_projects(&user, projects))
    }

    /// Filter an issue listing for the session's user.
    pub fn filter_issues(&self, session_id: &str, issues: Vec<Issue>) -> Result<Vec<Issue>> {
        let user = self.user_for(session_id)?;
        Ok(self.permissions.filter_issues(&user, issues))
    }

    /// Close a session. Returns `true` if it existed.
    pub fn logout(&self, session_id: &str) -> bool {
        self.sessions.remove_session(session_id)
    }

    /// Start the session sweep, identity provider probes and, when
    /// enabled, account health checks.
    pub fn start_background_tasks(&self) {
        self.sessions.start_cleanup();
        self.idps.start_monitor();
        if self.account_health_checks {
            self.monitor.start(&self.mapper);
        }
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.idps.stop_monitor();
        self.sessions.stop_cleanup();
        info!("Auth gateway stopped");
    }

    /// Health of every component.
    #[must_use]
    pub fn health(&self) -> GatewayHealth {
        GatewayHealth {
            identity_providers: self.idps.health_snapshot(),
            service_accounts: self.mapper.health_snapshot(),
            sessions: self.sessions.stats(),
            permission_cache: self.permissions.cache_stats(),
        }
    }

    /// Token validator.
    #[must_use]
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Identity provider registry.
    #[must_use]
    pub fn identity_providers(&self) -> &Arc<ExternalIdpManager> {
        &self.idps
    }

    /// Permission service.
    #[must_use]
    pub fn permissions(&self) -> &PermissionService {
        &self.permissions
    }

    /// Service account mapper.
    #[must_use]
    pub fn service_accounts(&self) -> &Arc<ServiceAccountMapper> {
        &self.mapper
    }

    /// Session manager.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn user_for(&self, session_id: &str) -> Result<UserContext> {
        let session = self.resume(session_id)?;
        Ok(UserContext::from_claims(session.claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IdpError;
    use crate::config::StaticKeyConfig;
    use crate::permissions::{MemoryAuditSink, PermissionConfig, PermissionRule};
    use crate::service_accounts::{BackendClient, BackendError, MappingRuleConfig, ServiceAccountConfig};
    use async_trait::async_trait;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, jwk::JwkSet};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ISSUER: &str = "https://idp.example.com";
    const SECRET: &str = "gateway-test-secret";

    struct NoJwks;

    #[async_trait]
    impl JwksFetcher for NoJwks {
        async fn fetch(&self, jwks_uri: &str) -> std::result::Result<JwkSet, IdpError> {
            Err(IdpError::Fetch {
                uri: jwks_uri.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    struct OkClient;

    #[async_trait]
    impl crate::service_accounts::BackendClient for OkClient {
        async fn ping(&self) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        fn base_url(&self) -> &str {
            "https://sonar.example.com"
        }
    }

    struct OkFactory;

    #[async_trait]
    impl ClientFactory for OkFactory {
        async fn create_client(
            &self,
            _token: &str,
            _url: &str,
            _organization: Option<&str>,
        ) -> std::result::Result<Arc<dyn BackendClient>, BackendError> {
            Ok(Arc::new(OkClient))
        }
    }

    fn config() -> Config {
        Config {
            auth: crate::config::AuthConfig {
                issuers: vec![ISSUER.to_string()],
                algorithms: vec![Algorithm::HS256],
                static_keys: vec![StaticKeyConfig {
                    issuer: ISSUER.to_string(),
                    secret: Some(SECRET.to_string()),
                    public_key_pem: None,
                }],
                ..crate::config::AuthConfig::default()
            },
            permissions: PermissionConfig {
                rules: vec![PermissionRule {
                    groups: Some(vec!["developer".to_string()]),
                    allowed_projects: vec!["^team-a-.*".to_string()],
                    allowed_tools: vec!["search_*".to_string(), "change_issue_status".to_string()],
                    priority: 50,
                    ..PermissionRule::default()
                }],
                default_rule: Some(PermissionRule {
                    allowed_tools: vec!["search_my_sonarqube_projects".to_string()],
                    readonly: true,
                    ..PermissionRule::default()
                }),
                enable_audit: true,
                ..PermissionConfig::default()
            },
            service_accounts: crate::config::ServiceAccountsConfig {
                accounts: vec![
                    ServiceAccountConfig {
                        id: "dev-sa".to_string(),
                        token: Some("squ_dev".to_string()),
                        ..ServiceAccountConfig::default()
                    },
                    ServiceAccountConfig {
                        id: "default".to_string(),
                        token: Some("squ_default".to_string()),
                        ..ServiceAccountConfig::default()
                    },
                ],
                rules: vec![MappingRuleConfig {
                    priority: 10,
                    user_pattern: Some("*@example.com".to_string()),
                    required_groups: vec!["developer".to_string()],
                    service_account_id: "dev-sa".to_string(),
                    ..MappingRuleConfig::default()
                }],
                default_account: Some("default".to_string()),
                ..crate::config::ServiceAccountsConfig::default()
            },
            ..Config::default()
        }
    }

    fn gateway(audit: &MemoryAuditSink) -> AuthGateway {
        AuthGateway::from_config(
            &config(),
            Collaborators {
                jwks_fetcher: Arc::new(NoJwks),
                client_factory: Arc::new(OkFactory),
                credential_store: None,
                audit_sink: Some(Arc::new(audit.clone())),
            },
        )
        .unwrap()
    }

    fn token(sub: &str, groups: &[&str]) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = json!({
            "sub": sub,
            "iss": ISSUER,
            "exp": now + 600,
            "iat": now,
            "groups": groups,
        });
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn authenticate_opens_session_bound_to_mapped_account() {
        // GIVEN: a developer token matching the dev mapping rule
        let audit = MemoryAuditSink::new();
        let gw = gateway(&audit);

        // WHEN: authenticating
        let session = gw.authenticate(&token("alice@example.com", &["developer"])).await.unwrap();

        // THEN: the session routes through the developer account
        assert_eq!(session.service_account_id, "dev-sa");
        assert_eq!(session.user.user_id, "alice@example.com");
        assert!(session.session_id.starts_with("sess_"));
        let resumed = gw.resume(&session.session_id).unwrap();
        assert_eq!(resumed.service_account_id.as_deref(), Some("dev-sa"));
    }

    #[tokio::test]
    async fn unmatched_user_falls_back_to_default_account() {
        let audit = MemoryAuditSink::new();
        let gw = gateway(&audit);

        let session = gw.authenticate(&token("bob@other.org", &["developer"])).await.unwrap();

        assert_eq!(session.service_account_id, "default");
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_without_session() {
        // GIVEN: a token signed with the wrong secret
        let audit = MemoryAuditSink::new();
        let gw = gateway(&audit);
        let now = chrono::Utc::now().timestamp();
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": "mallory", "iss": ISSUER, "exp": now + 600}),
            &EncodingKey::from_secret(b"wrong"),
        )
        .unwrap();

        // WHEN: authenticating
        let err = gw.authenticate(&forged).await.unwrap_err();

        // THEN: 401 with a challenge, and nothing was stored
        assert_eq!(err.http_status(), 401);
        assert!(err.challenge().is_some());
        assert!(gw.sessions().is_empty());
    }

    #[tokio::test]
    async fn authorization_follows_session_user_rule() {
        // GIVEN: one developer session and one default-rule session
        let audit = MemoryAuditSink::new();
        let gw = gateway(&audit);
        let dev = gw.authenticate(&token("alice@example.com", &["developer"])).await.unwrap();
        let guest = gw.authenticate(&token("guest@example.com", &[])).await.unwrap();

        // THEN: the developer can change issues in their projects
        assert!(gw.authorize_tool(&dev.session_id, "change_issue_status").unwrap().allowed);
        assert!(gw.authorize_project(&dev.session_id, "team-a-api").unwrap().allowed);
        assert!(!gw.authorize_project(&dev.session_id, "team-b-api").unwrap().allowed);

        // AND: the guest is limited to the read-only default rule
        let denied = gw.authorize_tool(&guest.session_id, "change_issue_status").unwrap();
        assert!(!denied.allowed);
        assert!(gw.authorize_tool(&guest.session_id, "search_my_sonarqube_projects").unwrap().allowed);

        // AND: every decision was audited
        assert_eq!(audit.entries().len(), 5);
    }

    #[tokio::test]
    async fn logout_invalidates_session() {
        let audit = MemoryAuditSink::new();
        let gw = gateway(&audit);
        let session = gw.authenticate(&token("alice@example.com", &["developer"])).await.unwrap();

        assert!(gw.logout(&session.session_id));
        assert!(!gw.logout(&session.session_id));

        let err = gw.authorize_tool(&session.session_id, "search_issues").unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn allow_listed_issuer_without_key_becomes_generic_provider() {
        // GIVEN: a second issuer with no static key or provider entry
        let mut config = config();
        config.auth.issuers.push("https://login.example.org".to_string());

        // WHEN: building the gateway
        let gw = AuthGateway::from_config(
            &config,
            Collaborators {
                jwks_fetcher: Arc::new(NoJwks),
                client_factory: Arc::new(OkFactory),
                credential_store: None,
                audit_sink: None,
            },
        )
        .unwrap();

        // THEN: only the keyless issuer is registered for JWKS lookup
        assert!(gw.identity_providers().has_idp("https://login.example.org"));
        assert!(!gw.identity_providers().has_idp(ISSUER));
        gw.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_identity_provider_monitor() {
        // GIVEN: a gateway with a monitored JWKS issuer
        let mut config = config();
        config.auth.issuers.push("https://login.example.org".to_string());
        let gw = AuthGateway::from_config(
            &config,
            Collaborators {
                jwks_fetcher: Arc::new(NoJwks),
                client_factory: Arc::new(OkFactory),
                credential_store: None,
                audit_sink: None,
            },
        )
        .unwrap();
        assert!(gw.identity_providers().is_monitoring());

        // WHEN: shutting down
        gw.shutdown();

        // THEN: the monitor is gone, and comes back on restart
        assert!(!gw.identity_providers().is_monitoring());
        gw.start_background_tasks();
        assert!(gw.identity_providers().is_monitoring());
        gw.shutdown();
        assert!(!gw.identity_providers().is_monitoring());
    }

    #[tokio::test]
    async fn background_tasks_start_and_stop() {
        let audit = MemoryAuditSink::new();
        let gw = gateway(&audit);

        gw.start_background_tasks();
        let health = gw.health();
        assert_eq!(health.service_accounts.len(), 2);
        assert_eq!(health.sessions.active, 0);

        gw.shutdown();
    }

    #[test]
    fn dangling_mapping_reference_fails_construction() {
        let mut config = config();
        config.service_accounts.rules[0].service_account_id = "ghost".to_string();

        let result = AuthGateway::from_config(
            &config,
            Collaborators {
                jwks_fetcher: Arc::new(NoJwks),
                client_factory: Arc::new(OkFactory),
                credential_store: None,
                audit_sink: None,
            },
        );

        assert!(result.is_err());
    }
}
