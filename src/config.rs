//! Configuration management

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::auth::{GroupsTransform, IdpProvider};
use crate::permissions::PermissionConfig;
use crate::service_accounts::{MappingRuleConfig, ServiceAccountConfig};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Bearer token validation
    pub auth: AuthConfig,
    /// Trusted external identity providers
    pub identity_providers: Vec<IdpConfig>,
    /// Identity provider probe settings
    pub idp_health: IdpHealthConfig,
    /// Permission rules
    pub permissions: PermissionConfig,
    /// Service accounts and mapping rules
    pub service_accounts: ServiceAccountsConfig,
    /// Session cache
    pub sessions: SessionConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (SONAR_AUTHGATE_ prefix)
        figment = figment.merge(Env::prefixed("SONAR_AUTHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        if config.service_accounts.from_env {
            config
                .service_accounts
                .merge_env_accounts(|key| std::env::var(key).ok());
        }
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Structural validation of every section.
    ///
    /// Pattern compilation happens when the owning component is built; this
    /// checks the shape of the configuration itself.
    pub fn validate(&self) -> Result<()> {
        self.auth.validate()?;
        for idp in &self.identity_providers {
            if idp.issuer.trim().is_empty() {
                return Err(Error::Config("identity provider with empty issuer".to_string()));
            }
        }
        self.permissions.validate()?;
        self.service_accounts.validate()?;
        self.sessions.validate()?;
        Ok(())
    }
}

/// Bearer token validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Issuer allow-list. Identity providers are added automatically.
    pub issuers: Vec<String>,
    /// Expected audiences (empty = audience not checked)
    pub audiences: Vec<String>,
    /// Accepted signature algorithms
    pub algorithms: Vec<Algorithm>,
    /// Clock skew tolerance for `exp` / `nbf`
    #[serde(with = "humantime_serde")]
    pub clock_tolerance: Duration,
    /// Validate the RFC 8707 `resource` claim when present
    pub validate_resource: bool,
    /// Resources a token may be bound to
    pub expected_resources: Vec<String>,
    /// How long fetched JWKS documents stay fresh
    #[serde(with = "humantime_serde")]
    pub key_cache_ttl: Duration,
    /// Fixed verification keys, bypassing JWKS lookup for an issuer
    pub static_keys: Vec<StaticKeyConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuers: Vec::new(),
            audiences: Vec::new(),
            algorithms: vec![
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
                Algorithm::ES256,
                Algorithm::ES384,
                Algorithm::EdDSA,
            ],
            clock_tolerance: Duration::from_secs(60),
            validate_resource: false,
            expected_resources: Vec::new(),
            key_cache_ttl: Duration::from_secs(3600),
            static_keys: Vec::new(),
        }
    }
}

impl AuthConfig {
    fn validate(&self) -> Result<()> {
        if self.algorithms.is_empty() {
            return Err(Error::Config("auth.algorithms must not be empty".to_string()));
        }
        if self.validate_resource && self.expected_resources.is_empty() {
            return Err(Error::Config(
                "auth.validate_resource requires auth.expected_resources".to_string(),
            ));
        }
        for key in &self.static_keys {
            let sources = [&key.secret, &key.public_key_pem]
                .iter()
                .filter(|s| s.is_some())
                .count();
            if sources != 1 {
                return Err(Error::Config(format!(
                    "static key for '{}' needs exactly one of secret / public_key_pem",
                    key.issuer
                )));
            }
        }
        Ok(())
    }
}

/// A fixed verification key for one issuer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticKeyConfig {
    /// Issuer the key belongs to
    pub issuer: String,
    /// Shared HMAC secret (supports `env:VAR_NAME`)
    #[serde(default)]
    pub secret: Option<String>,
    /// PEM-encoded RSA or EC public key
    #[serde(default)]
    pub public_key_pem: Option<String>,
}

impl StaticKeyConfig {
    /// Resolve the secret, expanding `env:VAR` references.
    ///
    /// An unset or empty variable is an error: the reference text itself
    /// must never become key material.
    pub fn resolve_secret(&self) -> Result<Option<String>> {
        let Some(secret) = &self.secret else {
            return Ok(None);
        };
        match secret.strip_prefix("env:") {
            Some(var) => match std::env::var(var) {
                Ok(value) if !value.is_empty() => Ok(Some(value)),
                _ => Err(Error::Config(format!(
                    "static key for '{}': env var {var} is not set",
                    self.issuer
                ))),
            },
            None => Ok(Some(secret.clone())),
        }
    }
}

/// External identity provider registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// Issuer URL (must equal the token `iss`)
    pub issuer: String,
    /// Provider family (selects claim defaults)
    pub provider: IdpProvider,
    /// JWKS location (default: `{issuer}/.well-known/jwks.json`)
    pub jwks_uri: Option<String>,
    /// Claim holding group memberships (default per provider)
    pub groups_claim: Option<String>,
    /// Group value transform (default per provider)
    pub groups_transform: Option<GroupsTransform>,
    /// Expected tenant id
    pub tenant_id: Option<String>,
    /// Source claim -> target claim copies applied after validation
    pub claim_mappings: HashMap<String, String>,
    /// Include this issuer in periodic health probes
    pub enable_health_monitoring: bool,
    /// Permit plain-http issuer and JWKS URLs (local development only)
    pub allow_insecure: bool,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            provider: IdpProvider::Generic,
            jwks_uri: None,
            groups_claim: None,
            groups_transform: None,
            tenant_id: None,
            claim_mappings: HashMap::new(),
            enable_health_monitoring: true,
            allow_insecure: false,
        }
    }
}

/// Identity provider health probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpHealthConfig {
    /// Probe interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-fetch timeout (also bounds request-path key fetches)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for IdpHealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Service account pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAccountsConfig {
    /// Backend credentials
    pub accounts: Vec<ServiceAccountConfig>,
    /// Mapping rules (priority-ordered)
    pub rules: Vec<MappingRuleConfig>,
    /// Account used when no rule matches
    pub default_account: Option<String>,
    /// Follow `fallback_account_id` links on failure
    pub enable_failover: bool,
    /// Consecutive failures before an account is marked unhealthy
    pub failure_threshold: u32,
    /// Also load accounts from `SONARQUBE_SA{n}_*` environment variables
    pub from_env: bool,
    /// Periodic account health checks
    pub health_check: AccountHealthCheckConfig,
}

impl Default for ServiceAccountsConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            rules: Vec::new(),
            default_account: None,
            enable_failover: true,
            failure_threshold: 3,
            from_env: false,
            health_check: AccountHealthCheckConfig::default(),
        }
    }
}

impl ServiceAccountsConfig {
    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config(
                "service_accounts.failure_threshold must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(Error::Config("service account with empty id".to_string()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate service account id '{}'",
                    account.id
                )));
            }
        }
        Ok(())
    }
}

/// Service account health check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountHealthCheckConfig {
    /// Enable periodic pings
    pub enabled: bool,
    /// Ping interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Ping timeout (also bounds request-path client validation)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AccountHealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Session cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle timeout measured from last activity
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Sweep interval for expired sessions
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            max_sessions: 1000,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::Config("sessions.max_sessions must be at least 1".to_string()));
        }
        if self.session_timeout.is_zero() || self.cleanup_interval.is_zero() {
            return Err(Error::Config(
                "sessions.session_timeout and sessions.cleanup_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
