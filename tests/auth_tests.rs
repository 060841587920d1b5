//! End-to-end authentication tests
//!
//! Tests the full pipeline against a YAML configuration:
//! - Bearer token validation with a static HMAC key
//! - Group-scoped permission rules
//! - Service account mapping and failover
//! - Session capacity and logout

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, jwk::JwkSet};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use sonar_authgate::auth::{IdpError, JwksFetcher, TokenError};
use sonar_authgate::config::Config;
use sonar_authgate::permissions::{Issue, REDACTED};
use sonar_authgate::service_accounts::{BackendClient, BackendError, ClientFactory};
use sonar_authgate::{AuthGateway, Collaborators, Error};

const ISSUER: &str = "https://idp.example.com";
const SECRET: &str = "e2e-shared-secret";

const CONFIG: &str = r#"
auth:
  issuers: ["https://idp.example.com"]
  audiences: ["sonar-mcp"]
  algorithms: [HS256]
  clock_tolerance: 5s
  static_keys:
    - issuer: https://idp.example.com
      secret: e2e-shared-secret
permissions:
  enable_audit: false
  default_rule:
    allowed_projects: []
    allowed_tools: ["search_my_sonarqube_projects"]
    readonly: true
  rules:
    - groups: [admin]
      allowed_projects: [".*"]
      allowed_tools: ["*"]
      readonly: false
      priority: 100
    - groups: [developer]
      allowed_projects: ["^team-a-"]
      allowed_tools: ["search_*", "get_*", "markIssueFalsePositive"]
      denied_tools: ["get_raw_source"]
      readonly: false
      max_severity: CRITICAL
      hide_sensitive_data: true
      priority: 50
service_accounts:
  accounts:
    - id: admin-sa
      token: squ_admin
    - id: dev-sa
      token: down_dev
      fallback_account_id: default
    - id: default
      token: squ_default
  rules:
    - priority: 100
      required_groups: [admin]
      service_account_id: admin-sa
    - priority: 50
      required_groups: [developer]
      service_account_id: dev-sa
  default_account: default
  health_check:
    enabled: false
sessions:
  max_sessions: 2
  session_timeout: 10m
"#;

struct NoJwks;

#[async_trait]
impl JwksFetcher for NoJwks {
    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet, IdpError> {
        Err(IdpError::Fetch {
            uri: jwks_uri.to_string(),
            reason: "offline".to_string(),
        })
    }
}

struct FakeClient {
    healthy: bool,
}

#[async_trait]
impl BackendClient for FakeClient {
    async fn ping(&self) -> Result<(), BackendError> {
        if self.healthy {
            Ok(())
        } else {
            Err(BackendError::Status(503))
        }
    }

    fn base_url(&self) -> &str {
        "https://sonar.example.com"
    }
}

/// Clients built from tokens starting with `down` fail their ping.
struct FakeFactory;

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create_client(
        &self,
        token: &str,
        _url: &str,
        _organization: Option<&str>,
    ) -> Result<Arc<dyn BackendClient>, BackendError> {
        Ok(Arc::new(FakeClient {
            healthy: !token.starts_with("down"),
        }))
    }
}

fn load_config() -> Config {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    Config::load(Some(file.path())).unwrap()
}

fn gateway() -> AuthGateway {
    AuthGateway::from_config(
        &load_config(),
        Collaborators {
            jwks_fetcher: Arc::new(NoJwks),
            client_factory: Arc::new(FakeFactory),
            credential_store: None,
            audit_sink: None,
        },
    )
    .unwrap()
}

fn mint(claims: &Value) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn token(sub: &str, groups: &[&str]) -> String {
    let now = chrono::Utc::now().timestamp();
    mint(&json!({
        "sub": sub,
        "iss": ISSUER,
        "aud": "sonar-mcp",
        "exp": now + 600,
        "iat": now,
        "groups": groups,
    }))
}

/// Test that an admin is routed to the admin account and may use any tool
#[tokio::test]
async fn test_admin_full_access() {
    let gw = gateway();

    let session = gw.authenticate(&token("root", &["admin"])).await.unwrap();

    assert_eq!(session.service_account_id, "admin-sa");
    assert!(gw.authorize_tool(&session.session_id, "resolveIssue").unwrap().allowed);
    assert!(gw.authorize_project(&session.session_id, "anything").unwrap().allowed);
}

/// Test that a failing primary account fails over to its declared fallback
#[tokio::test]
async fn test_developer_fails_over_to_default_account() {
    let gw = gateway();

    let session = gw.authenticate(&token("alice", &["developer"])).await.unwrap();

    // dev-sa pings fail, so the session is bound to the fallback
    assert_eq!(session.service_account_id, "default");
    let dev = gw.service_accounts().health("dev-sa").unwrap();
    assert_eq!(dev.consecutive_failures, 1);
}

/// Test developer tool and project scoping
#[tokio::test]
async fn test_developer_scope() {
    let gw = gateway();
    let session = gw.authenticate(&token("alice", &["developer"])).await.unwrap();
    let id = &session.session_id;

    // Globs and explicit names
    assert!(gw.authorize_tool(id, "search_sonar_issues_in_projects").unwrap().allowed);
    assert!(gw.authorize_tool(id, "markIssueFalsePositive").unwrap().allowed);

    // Deny list wins over a matching allow glob
    let denied = gw.authorize_tool(id, "get_raw_source").unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.reason.as_deref(), Some("Tool 'get_raw_source' is explicitly denied"));

    // Project patterns
    assert!(gw.authorize_project(id, "team-a-web").unwrap().allowed);
    assert!(!gw.authorize_project(id, "team-b-web").unwrap().allowed);
}

/// Test that users without a matching rule fall to the read-only default
#[tokio::test]
async fn test_default_rule_is_read_only() {
    let gw = gateway();
    let session = gw.authenticate(&token("guest", &[])).await.unwrap();

    assert_eq!(session.service_account_id, "default");
    assert!(gw.authorize_tool(&session.session_id, "search_my_sonarqube_projects").unwrap().allowed);
    assert!(!gw.authorize_tool(&session.session_id, "markIssueFalsePositive").unwrap().allowed);
    assert!(!gw.authorize_project(&session.session_id, "team-a-web").unwrap().allowed);
}

/// Test issue filtering and redaction for a session
#[tokio::test]
async fn test_issue_filtering_for_developer() {
    let gw = gateway();
    let session = gw.authenticate(&token("alice", &["developer"])).await.unwrap();

    let issues: Vec<Issue> = serde_json::from_value(json!([
        {"key": "I1", "project": "team-a-web", "severity": "MAJOR", "author": "bob", "line": 12},
        {"key": "I2", "project": "team-a-web", "severity": "BLOCKER", "author": "bob"},
        {"key": "I3", "project": "team-b-web", "severity": "MINOR"}
    ]))
    .unwrap();

    let visible = gw.filter_issues(&session.session_id, issues).unwrap();

    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].key, "I1");
    assert_eq!(visible[0].author.as_deref(), Some(REDACTED));
    assert_eq!(visible[0].extra.get("line"), Some(&json!(12)));
}

/// Test rejected tokens
#[tokio::test]
async fn test_rejected_tokens() {
    let gw = gateway();
    let now = chrono::Utc::now().timestamp();

    // Expired beyond the clock tolerance
    let expired = mint(&json!({"sub": "a", "iss": ISSUER, "aud": "sonar-mcp", "exp": now - 600}));
    let err = gw.authenticate(&expired).await.unwrap_err();
    assert!(matches!(err, Error::Token(TokenError::Expired(_))));
    assert_eq!(err.http_status(), 401);
    assert!(err.challenge().unwrap().contains("error=\"invalid_token\""));

    // Wrong audience
    let wrong_aud = mint(&json!({"sub": "a", "iss": ISSUER, "aud": "other", "exp": now + 600}));
    let err = gw.authenticate(&wrong_aud).await.unwrap_err();
    assert!(matches!(err, Error::Token(TokenError::InvalidAudience(_))));

    // Unknown issuer
    let foreign = mint(&json!({"sub": "a", "iss": "https://evil.example.net", "aud": "sonar-mcp", "exp": now + 600}));
    let err = gw.authenticate(&foreign).await.unwrap_err();
    assert!(matches!(err, Error::Token(TokenError::InvalidIssuer(_))));

    // Garbage
    let err = gw.authenticate("not-a-jwt").await.unwrap_err();
    assert!(matches!(err, Error::Token(TokenError::InvalidToken(_))));

    assert!(gw.sessions().is_empty());
}

/// Test that the oldest session is evicted at capacity
#[tokio::test]
async fn test_session_capacity_evicts_oldest() {
    let gw = gateway();

    let first = gw.authenticate(&token("u1", &[])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = gw.authenticate(&token("u2", &[])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = gw.authenticate(&token("u3", &[])).await.unwrap();

    assert_eq!(gw.sessions().len(), 2);
    assert!(matches!(gw.resume(&first.session_id), Err(Error::SessionNotFound(_))));
    assert!(gw.resume(&second.session_id).is_ok());
    assert!(gw.resume(&third.session_id).is_ok());
    assert_eq!(gw.health().sessions.evictions, 1);
}

/// Test logout
#[tokio::test]
async fn test_logout() {
    let gw = gateway();
    let session = gw.authenticate(&token("alice", &["developer"])).await.unwrap();

    assert!(gw.logout(&session.session_id));
    assert!(gw.resume(&session.session_id).is_err());
    assert!(!gw.logout(&session.session_id));
}
