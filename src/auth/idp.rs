//! External identity provider registry.
//!
//! Tracks every trusted issuer, resolves its signing keys through the
//! [`JwksCache`], normalizes provider-specific group claims, and keeps a
//! per-issuer health record.
//!
//! # Health monitoring
//!
//! A single timer probes every issuer that has monitoring enabled by forcing
//! a JWKS fetch. The timer starts when the first monitored issuer is added
//! and stops when the last one is removed. Request paths never wait on a
//! probe; they only read the last recorded [`IdpHealth`].
//!
//! # Group transforms
//!
//! | Transform | String input | Object input |
//! |-----------|--------------|--------------|
//! | `extract_name` | `CN=Admins,OU=Groups` -> `Admins` | `displayName` / `name` field |
//! | `extract_id` | `/org/admins` -> `admins` | `id` field |
//! | `none` | unchanged | JSON text |

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::claims::Claims;
use super::jwks::{JwksCache, JwksFetcher, Refresh, VerificationKey, select_key};
use crate::config::{IdpConfig, IdpHealthConfig};

/// Claim key carrying the provider name after normalization.
pub const PROVIDER_MARKER: &str = "_idp_provider";
/// Claim key carrying the issuer after normalization.
pub const ISSUER_MARKER: &str = "_idp_issuer";
/// Claim key carrying the tenant id after normalization.
pub const TENANT_MARKER: &str = "_idp_tenant";

/// Identity provider errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdpError {
    /// The IdP configuration is malformed.
    #[error("Invalid identity provider config: {0}")]
    InvalidConfig(String),

    /// No IdP is registered for this issuer.
    #[error("Unknown issuer: {0}")]
    UnknownIssuer(String),

    /// JWKS could not be fetched or parsed.
    #[error("JWKS fetch from {uri} failed: {reason}")]
    Fetch {
        /// JWKS URI
        uri: String,
        /// Underlying failure
        reason: String,
    },

    /// JWKS fetch exceeded the probe timeout.
    #[error("JWKS fetch for {0} timed out")]
    Timeout(String),

    /// The key set holds no usable key for this `kid`.
    #[error("No signing key '{kid}' published by {issuer}")]
    KeyNotFound {
        /// Issuer URL
        issuer: String,
        /// Requested key id (`*` when the token had none)
        kid: String,
    },
}

/// Known identity provider families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdpProvider {
    /// Microsoft Entra ID / Azure AD
    AzureAd,
    /// Okta
    Okta,
    /// Auth0
    Auth0,
    /// Keycloak
    Keycloak,
    /// Directory-backed issuers emitting DN-style groups
    Ldap,
    /// Any other OIDC-compliant issuer
    #[default]
    Generic,
}

impl IdpProvider {
    /// Default groups claim name for this provider.
    #[must_use]
    pub fn default_groups_claim(self) -> &'static str {
        match self {
            Self::Auth0 => "https://auth0.com/groups",
            _ => "groups",
        }
    }

    /// Default groups transform for this provider.
    #[must_use]
    pub fn default_transform(self) -> GroupsTransform {
        match self {
            Self::Keycloak => GroupsTransform::ExtractId,
            Self::Ldap => GroupsTransform::ExtractName,
            _ => GroupsTransform::None,
        }
    }

    /// Provider name as written in config.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AzureAd => "azure_ad",
            Self::Okta => "okta",
            Self::Auth0 => "auth0",
            Self::Keycloak => "keycloak",
            Self::Ldap => "ldap",
            Self::Generic => "generic",
        }
    }
}

/// How raw group values become group names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupsTransform {
    /// Name-like field of a structured value.
    ExtractName,
    /// Id-like field of a structured value.
    ExtractId,
    /// Pass through as a string.
    #[default]
    None,
}

impl GroupsTransform {
    /// Apply the transform to one group value. Never fails; unrecognized
    /// shapes degrade to their original text.
    #[must_use]
    pub fn apply(self, value: &Value) -> String {
        match (self, value) {
            (Self::ExtractName, Value::String(s)) => extract_dn_name(s).unwrap_or_else(|| s.clone()),
            (Self::ExtractName, Value::Object(obj)) => ["displayName", "display_name", "name"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map_or_else(|| value.to_string(), str::to_string),
            (Self::ExtractId, Value::String(s)) => s
                .trim_end_matches('/')
                .rsplit('/')
                .find(|seg| !seg.is_empty())
                .map_or_else(|| s.clone(), str::to_string),
            (Self::ExtractId, Value::Object(obj)) => match obj.get("id") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => value.to_string(),
            },
            (_, Value::String(s)) => s.clone(),
            _ => value.to_string(),
        }
    }
}

/// `CN=Admins,OU=Groups,DC=corp` -> `Admins`.
fn extract_dn_name(dn: &str) -> Option<String> {
    let first = dn.split(',').next()?;
    let (_, name) = first.split_once('=')?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Health record for one issuer.
#[derive(Debug, Clone, Serialize)]
pub struct IdpHealth {
    /// Issuer URL
    pub issuer: String,
    /// Last known status
    pub healthy: bool,
    /// Last successful key fetch
    pub last_success: Option<DateTime<Utc>>,
    /// Last failed key fetch
    pub last_failure: Option<DateTime<Utc>>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Most recent error text
    pub last_error: Option<String>,
}

impl IdpHealth {
    fn new(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            healthy: true,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// An IdP config with provider defaults merged in.
#[derive(Debug, Clone)]
struct ResolvedIdp {
    issuer: String,
    provider: IdpProvider,
    jwks_uri: String,
    groups_claim: String,
    transform: GroupsTransform,
    tenant_id: Option<String>,
    claim_mappings: HashMap<String, String>,
    monitored: bool,
}

impl ResolvedIdp {
    fn from_config(config: &IdpConfig) -> Result<Self, IdpError> {
        let issuer = Url::parse(&config.issuer)
            .map_err(|e| IdpError::InvalidConfig(format!("issuer '{}': {e}", config.issuer)))?;
        check_scheme(&issuer, config.allow_insecure, "issuer")?;

        let jwks_uri = config
            .jwks_uri
            .clone()
            .unwrap_or_else(|| default_jwks_uri(&config.issuer));
        let parsed = Url::parse(&jwks_uri)
            .map_err(|e| IdpError::InvalidConfig(format!("jwks_uri '{jwks_uri}': {e}")))?;
        check_scheme(&parsed, config.allow_insecure, "jwks_uri")?;

        Ok(Self {
            issuer: config.issuer.clone(),
            provider: config.provider,
            jwks_uri,
            groups_claim: config
                .groups_claim
                .clone()
                .unwrap_or_else(|| config.provider.default_groups_claim().to_string()),
            transform: config
                .groups_transform
                .unwrap_or_else(|| config.provider.default_transform()),
            tenant_id: config.tenant_id.clone(),
            claim_mappings: config.claim_mappings.clone(),
            monitored: config.enable_health_monitoring,
        })
    }
}

fn check_scheme(url: &Url, allow_insecure: bool, field: &str) -> Result<(), IdpError> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if allow_insecure => Ok(()),
        other => Err(IdpError::InvalidConfig(format!(
            "{field} must use https (got '{other}')"
        ))),
    }
}

/// Derive the conventional JWKS location from an issuer URL.
fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}

/// State shared between the manager and its probe task.
struct IdpRegistry {
    idps: DashMap<String, ResolvedIdp>,
    health: DashMap<String, IdpHealth>,
    jwks: JwksCache,
    fetcher: Arc<dyn JwksFetcher>,
    fetch_timeout: Duration,
}

impl IdpRegistry {
    async fn fetch_key(
        &self,
        idp: &ResolvedIdp,
        kid: Option<&str>,
    ) -> Result<VerificationKey, IdpError> {
        let jwks = self.fetch_jwks(idp, Refresh::IfStale).await?;
        if let Some(key) = select_key(&jwks, kid) {
            return Ok(key);
        }

        debug!(issuer = %idp.issuer, kid = ?kid, "Key not in cached JWKS, refreshing");
        let jwks = self.fetch_jwks(idp, Refresh::KeyMiss).await?;
        select_key(&jwks, kid).ok_or_else(|| IdpError::KeyNotFound {
            issuer: idp.issuer.clone(),
            kid: kid.unwrap_or("*").to_string(),
        })
    }

    async fn fetch_jwks(
        &self,
        idp: &ResolvedIdp,
        refresh: Refresh,
    ) -> Result<jsonwebtoken::jwk::JwkSet, IdpError> {
        tokio::time::timeout(
            self.fetch_timeout,
            self.jwks
                .get_or_fetch(self.fetcher.as_ref(), &idp.issuer, &idp.jwks_uri, refresh),
        )
        .await
        .map_err(|_| IdpError::Timeout(idp.issuer.clone()))?
    }

    fn record_success(&self, issuer: &str) {
        let mut entry = self
            .health
            .entry(issuer.to_string())
            .or_insert_with(|| IdpHealth::new(issuer));
        if !entry.healthy {
            info!(issuer = %issuer, "Identity provider recovered");
        }
        entry.healthy = true;
        entry.last_success = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    fn record_failure(&self, issuer: &str, error: &IdpError) {
        let mut entry = self
            .health
            .entry(issuer.to_string())
            .or_insert_with(|| IdpHealth::new(issuer));
        entry.healthy = false;
        entry.last_failure = Some(Utc::now());
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());
        warn!(
            issuer = %issuer,
            consecutive_failures = entry.consecutive_failures,
            error = %error,
            "Identity provider marked unhealthy"
        );
    }

    fn has_monitored(&self) -> bool {
        self.idps.iter().any(|e| e.value().monitored)
    }

    async fn probe_all(&self) {
        let targets: Vec<ResolvedIdp> = self
            .idps
            .iter()
            .filter(|e| e.value().monitored)
            .map(|e| e.value().clone())
            .collect();

        let probes = targets.iter().map(|idp| async move {
            match self.fetch_jwks(idp, Refresh::Always).await {
                Ok(_) => self.record_success(&idp.issuer),
                Err(e) => self.record_failure(&idp.issuer, &e),
            }
        });
        futures::future::join_all(probes).await;
    }
}

/// Registry of trusted external identity providers.
pub struct ExternalIdpManager {
    registry: Arc<IdpRegistry>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    probe_interval: Duration,
}

impl ExternalIdpManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new(fetcher: Arc<dyn JwksFetcher>, health: &IdpHealthConfig, key_cache_ttl: Duration) -> Self {
        Self {
            registry: Arc::new(IdpRegistry {
                idps: DashMap::new(),
                health: DashMap::new(),
                jwks: JwksCache::new(key_cache_ttl),
                fetcher,
                fetch_timeout: health.timeout,
            }),
            monitor: Mutex::new(None),
            probe_interval: health.interval,
        }
    }

    /// Register an issuer, replacing any previous registration.
    pub fn add_idp(&self, config: &IdpConfig) -> Result<(), IdpError> {
        let resolved = ResolvedIdp::from_config(config)?;
        let issuer = resolved.issuer.clone();
        let monitored = resolved.monitored;

        if self.registry.idps.insert(issuer.clone(), resolved).is_some() {
            self.registry.jwks.invalidate(&issuer);
            debug!(issuer = %issuer, "Replaced identity provider registration");
        }
        self.registry
            .health
            .insert(issuer.clone(), IdpHealth::new(&issuer));

        info!(issuer = %issuer, provider = config.provider.as_str(), "Registered identity provider");

        if monitored {
            self.ensure_monitor();
        } else {
            self.stop_monitor_if_idle();
        }
        Ok(())
    }

    /// Unregister an issuer and drop its cached keys.
    ///
    /// Returns `true` if the issuer was registered.
    pub fn remove_idp(&self, issuer: &str) -> bool {
        let removed = self.registry.idps.remove(issuer).is_some();
        self.registry.jwks.invalidate(issuer);
        self.registry.health.remove(issuer);
        self.stop_monitor_if_idle();
        if removed {
            info!(issuer = %issuer, "Removed identity provider");
        }
        removed
    }

    /// Returns `true` if the issuer is registered.
    #[must_use]
    pub fn has_idp(&self, issuer: &str) -> bool {
        self.registry.idps.contains_key(issuer)
    }

    /// Registered issuers.
    #[must_use]
    pub fn issuers(&self) -> Vec<String> {
        self.registry.idps.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolve the verification key for `(issuer, kid)`.
    ///
    /// Updates the issuer's health record as a side effect.
    pub async fn get_public_key(
        &self,
        issuer: &str,
        kid: Option<&str>,
    ) -> Result<VerificationKey, IdpError> {
        let idp = self
            .registry
            .idps
            .get(issuer)
            .map(|e| e.value().clone())
            .ok_or_else(|| IdpError::UnknownIssuer(issuer.to_string()))?;

        match self.registry.fetch_key(&idp, kid).await {
            Ok(key) => {
                self.registry.record_success(issuer);
                Ok(key)
            }
            Err(e) => {
                self.registry.record_failure(issuer, &e);
                Err(e)
            }
        }
    }

    /// Normalize provider-specific claims.
    ///
    /// Groups are read from the provider's groups claim (falling back to
    /// `groups`), transformed to plain names, and written back to
    /// [`Claims::groups`]. Configured claim mappings are copied, and
    /// provider/issuer/tenant markers are added to [`Claims::extra`].
    /// Unknown issuers are returned unchanged.
    #[must_use]
    pub fn extract_claims(&self, issuer: &str, mut claims: Claims) -> Claims {
        let Some(idp) = self.registry.idps.get(issuer).map(|e| e.value().clone()) else {
            return claims;
        };

        let raw = claims
            .get(&idp.groups_claim)
            .or_else(|| claims.groups.clone());
        if let Some(raw) = raw {
            let groups = normalize_groups(&raw, idp.transform);
            claims.groups = Some(Value::Array(groups.into_iter().map(Value::String).collect()));
        }

        for (source, target) in &idp.claim_mappings {
            let Some(value) = claims.get(source) else {
                continue;
            };
            match target.as_str() {
                "groups" => {
                    let groups = normalize_groups(&value, idp.transform);
                    claims.groups = Some(Value::Array(groups.into_iter().map(Value::String).collect()));
                }
                "roles" => claims.roles = Some(value),
                _ => {
                    claims.extra.insert(target.clone(), value);
                }
            }
        }

        claims
            .extra
            .insert(PROVIDER_MARKER.to_string(), Value::String(idp.provider.as_str().to_string()));
        claims
            .extra
            .insert(ISSUER_MARKER.to_string(), Value::String(idp.issuer.clone()));

        let token_tenant = claims.extra_str("tid").map(str::to_string);
        if let Some(tenant) = idp.tenant_id.clone().or(token_tenant.clone()) {
            if let (Some(expected), Some(actual)) = (&idp.tenant_id, &token_tenant) {
                if expected != actual {
                    warn!(issuer = %issuer, expected = %expected, actual = %actual, "Token tenant differs from configured tenant");
                }
            }
            claims.extra.insert(TENANT_MARKER.to_string(), Value::String(tenant));
        }

        claims
    }

    /// Health record for one issuer.
    #[must_use]
    pub fn health(&self, issuer: &str) -> Option<IdpHealth> {
        self.registry.health.get(issuer).map(|e| e.value().clone())
    }

    /// Health records for all issuers.
    #[must_use]
    pub fn health_snapshot(&self) -> Vec<IdpHealth> {
        self.registry.health.iter().map(|e| e.value().clone()).collect()
    }

    /// Probe every monitored issuer once, now.
    pub async fn probe_now(&self) {
        self.registry.probe_all().await;
    }

    /// Drop all cached key sets.
    pub fn clear_key_cache(&self) {
        self.registry.jwks.clear();
        debug!("Cleared JWKS cache");
    }

    /// Returns `true` while the probe timer is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the probe timer if any issuer has monitoring enabled.
    ///
    /// Does nothing when the timer is already running or no async runtime
    /// is available.
    pub fn start_monitor(&self) {
        if self.registry.has_monitored() {
            self.ensure_monitor();
        }
    }

    /// Stop the probe timer. Registered issuers are kept.
    pub fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
            info!("Stopped identity provider health probes");
        }
    }

    fn ensure_monitor(&self) {
        let mut guard = self.monitor.lock();
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; identity provider probes not started");
            return;
        };

        let registry: Weak<IdpRegistry> = Arc::downgrade(&self.registry);
        let period = self.probe_interval;
        *guard = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.probe_all().await;
            }
        }));
        info!(interval_secs = period.as_secs(), "Started identity provider health probes");
    }

    fn stop_monitor_if_idle(&self) {
        if !self.registry.has_monitored() {
            self.stop_monitor();
        }
    }
}

impl Drop for ExternalIdpManager {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.abort();
        }
    }
}

/// Turn a raw groups claim into a list of names.
///
/// Arrays are transformed element-wise. A string holding a DN is a single
/// group; any other string is split on whitespace and commas.
fn normalize_groups(raw: &Value, transform: GroupsTransform) -> Vec<String> {
    let mut out: Vec<String> = match raw {
        Value::Array(items) => items.iter().map(|v| transform.apply(v)).collect(),
        Value::String(s) if transform == GroupsTransform::ExtractName && s.contains('=') => {
            vec![transform.apply(raw)]
        }
        Value::String(s) => s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|g| !g.is_empty())
            .map(|g| transform.apply(&Value::String(g.to_string())))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![transform.apply(other)],
    };
    out.retain(|g| !g.is_empty());
    out
}
