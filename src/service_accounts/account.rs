//! Service account and mapping rule configuration.
//!
//! Accounts come from the config file or from the indexed environment
//! convention:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `SONARQUBE_TOKEN` / `_URL` / `_ORGANIZATION` | Default account (`default`) |
//! | `SONARQUBE_SA{n}_TOKEN` | Token of account `sa{n}`, n = 1..=10 |
//! | `SONARQUBE_SA{n}_URL` | Backend URL |
//! | `SONARQUBE_SA{n}_ORGANIZATION` | Organization key |
//! | `SONARQUBE_SA{n}_SCOPES` | Scopes a user needs to be mapped to `sa{n}` |
//! | `SONARQUBE_SA{n}_FALLBACK` | Fallback account id |

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServiceAccountsConfig;

/// Highest `n` read from `SONARQUBE_SA{n}_*`.
pub const MAX_ENV_ACCOUNTS: u8 = 10;

/// Id of the account built from `SONARQUBE_TOKEN`.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Backend URL used when an account does not name one.
pub const DEFAULT_BACKEND_URL: &str = "https://sonarcloud.io";

/// One backend credential.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAccountConfig {
    /// Unique id
    pub id: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inline token; a credential store entry for `id` takes precedence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Backend URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Organization key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Scopes this account is meant for
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Account to try when this one fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_account_id: Option<String>,
}

impl ServiceAccountConfig {
    /// Backend URL, or [`DEFAULT_BACKEND_URL`].
    #[must_use]
    pub fn url_or_default(&self) -> &str {
        self.url.as_deref().unwrap_or(DEFAULT_BACKEND_URL)
    }
}

impl fmt::Debug for ServiceAccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("url", &self.url)
            .field("organization", &self.organization)
            .field("scopes", &self.scopes)
            .field("fallback_account_id", &self.fallback_account_id)
            .finish()
    }
}

/// Maps users to a service account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingRuleConfig {
    /// Evaluation priority (higher first)
    #[serde(default)]
    pub priority: i32,
    /// Subject pattern (glob, or `regex:`-prefixed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_pattern: Option<String>,
    /// Issuer pattern (glob, or `regex:`-prefixed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_pattern: Option<String>,
    /// Scopes the user must hold, all of them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_scopes: Vec<String>,
    /// Groups of which the user must hold at least one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_groups: Vec<String>,
    /// Target account
    pub service_account_id: String,
}

impl ServiceAccountsConfig {
    /// Add accounts described by environment variables.
    ///
    /// Accounts already present in configuration keep their settings; an
    /// environment account with the same id is ignored. Each `sa{n}` account
    /// gets a mapping rule with priority `100 - n` requiring its scopes.
    pub fn merge_env_accounts(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        for n in 1..=MAX_ENV_ACCOUNTS {
            let prefix = format!("SONARQUBE_SA{n}");
            let Some(token) = var(&format!("{prefix}_TOKEN")) else {
                continue;
            };
            let id = format!("sa{n}");
            if self.accounts.iter().any(|a| a.id == id) {
                debug!(account = %id, "Configured account shadows environment account");
                continue;
            }

            let scopes: Vec<String> = var(&format!("{prefix}_SCOPES"))
                .map(|s| {
                    s.split(|c: char| c.is_whitespace() || c == ',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            self.rules.push(MappingRuleConfig {
                priority: 100 - i32::from(n),
                required_scopes: scopes.clone(),
                service_account_id: id.clone(),
                ..MappingRuleConfig::default()
            });
            self.accounts.push(ServiceAccountConfig {
                id: id.clone(),
                name: Some(format!("Service account {n}")),
                token: Some(token),
                url: var(&format!("{prefix}_URL")),
                organization: var(&format!("{prefix}_ORGANIZATION")),
                scopes,
                fallback_account_id: var(&format!("{prefix}_FALLBACK")),
            });
            debug!(account = %id, "Loaded service account from environment");
        }

        if let Some(token) = var("SONARQUBE_TOKEN") {
            if !self.accounts.iter().any(|a| a.id == DEFAULT_ACCOUNT_ID) {
                self.accounts.push(ServiceAccountConfig {
                    id: DEFAULT_ACCOUNT_ID.to_string(),
                    name: Some("Default service account".to_string()),
                    token: Some(token),
                    url: var("SONARQUBE_URL"),
                    organization: var("SONARQUBE_ORGANIZATION"),
                    ..ServiceAccountConfig::default()
                });
            }
            if self.default_account.is_none() {
                self.default_account = Some(DEFAULT_ACCOUNT_ID.to_string());
            }
        }
    }
}
